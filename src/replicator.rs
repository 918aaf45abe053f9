use tracing::{info, warn};

use crate::postgres::{
    ChangeEvent, Lsn, PgOutputDecoder, ReplicationConnection, StreamingLoop,
};
use crate::{Config, Result};

/// Wires configuration, session setup, and the streaming loop together and
/// runs until the stream fails or the process is asked to stop.
pub struct Replicator {
    config: Config,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Replicator starting");

        let connection = ReplicationConnection::connect(&self.config.postgres).await?;
        let system = connection.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Connected to server"
        );

        if self.config.replication.create_publication {
            connection.create_publication().await?;
        }
        if self.config.replication.create_slot {
            connection.create_replication_slot().await?;
        }

        let start_lsn = match &self.config.replication.start_lsn {
            Some(raw) => Lsn::parse(raw)?,
            None => system.xlogpos,
        };

        let transport = connection.start_replication(start_lsn).await?;
        let mut stream = StreamingLoop::new(
            transport,
            log_event_sink(),
            PgOutputDecoder::default(),
            start_lsn,
            self.config.replication.status_interval(),
        );

        let stop = stream.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, stopping replication stream");
                stop.stop();
            }
        });

        let result = stream.run().await;
        info!("Stream stopped at confirmed LSN {}", stream.confirmed_lsn());
        result
    }
}

/// Sink that reports every decoded event on the log, in the shape consumers
/// of the JSON log output expect.
fn log_event_sink() -> impl FnMut(ChangeEvent) -> Result<()> {
    |event| {
        match &event {
            ChangeEvent::Unhandled { tag } => {
                warn!("unhandled replication message type: {}", *tag as char);
            }
            event => match serde_json::to_string(event) {
                Ok(json) => info!(event = %json, "change event"),
                Err(e) => warn!("failed to serialize change event: {}", e),
            },
        }
        Ok(())
    }
}
