//! Session setup around the streaming core: replication-mode connection,
//! slot and publication bootstrap, and the transport adapter that carries
//! copy-data frames once `START_REPLICATION` has been issued.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, CopyBothDuplex, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

use super::lsn::Lsn;
use super::stream::ReplicationTransport;
use crate::config::PostgresConfig;
use crate::{Error, Result};

/// A PostgreSQL connection opened with `replication=database`, able to run
/// the replication-protocol admin commands and enter streaming mode.
pub struct ReplicationConnection {
    client: tokio_postgres::Client,
    connection_task: JoinHandle<()>,
    slot_name: String,
    publication_name: String,
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        let pg_config = config.replication_url().parse::<Config>()?;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let (client, connection) = timeout(connect_timeout, pg_config.connect(NoTls))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connect to {}:{}", config.host, config.port),
            })??;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL in replication mode");

        Ok(Self {
            client,
            connection_task,
            slot_name: config.slot_name.clone(),
            publication_name: config.publication.clone(),
        })
    }

    /// Run `IDENTIFY_SYSTEM` and report the server's identity and current
    /// WAL position.
    pub async fn identify_system(&self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.client.simple_query("IDENTIFY_SYSTEM").await?;
        for message in rows {
            if let SimpleQueryMessage::Row(row) = message {
                let info = SystemInfo {
                    system_id: row.get("systemid").unwrap_or_default().to_string(),
                    timeline: row.get("timeline").unwrap_or("1").parse().unwrap_or(1),
                    xlogpos: Lsn::parse(row.get("xlogpos").unwrap_or("0/0"))?,
                    dbname: row.get("dbname").map(|s| s.to_string()),
                };
                debug!("System info: {:?}", info);
                return Ok(info);
            }
        }

        Err(Error::Connection(
            "IDENTIFY_SYSTEM returned no rows".to_string(),
        ))
    }

    /// Create the logical replication slot, tolerating one that already
    /// exists.
    pub async fn create_replication_slot(&self) -> Result<()> {
        info!("Creating replication slot: {}", self.slot_name);

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            self.slot_name
        );

        match self.client.simple_query(&query).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        let slot = row.get("slot_name").unwrap_or("unknown");
                        let lsn = row.get("consistent_point").unwrap_or("unknown");
                        info!("Created replication slot '{}' at LSN {}", slot, lsn);
                    }
                }
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                info!("Replication slot '{}' already exists", self.slot_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    /// Drop the replication slot, tolerating one that never existed.
    pub async fn drop_replication_slot(&self) -> Result<()> {
        info!("Dropping replication slot: {}", self.slot_name);

        let query = format!("DROP_REPLICATION_SLOT {}", self.slot_name);
        match self.client.simple_query(&query).await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_OBJECT) => {
                warn!("Replication slot '{}' does not exist", self.slot_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    /// Create a publication covering all tables, tolerating one that
    /// already exists.
    pub async fn create_publication(&self) -> Result<()> {
        info!("Creating publication: {}", self.publication_name);

        let query = format!(
            "CREATE PUBLICATION {} FOR ALL TABLES",
            self.publication_name
        );
        match self.client.simple_query(&query).await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                info!("Publication '{}' already exists", self.publication_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    /// Issue `START_REPLICATION` and hand back the copy-both transport the
    /// streaming loop reads from. Consumes the connection; the admin
    /// commands are unavailable once streaming starts.
    pub async fn start_replication(self, start_lsn: Lsn) -> Result<PgTransport> {
        info!("Starting replication from LSN: {}", start_lsn);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            self.slot_name, start_lsn, self.publication_name
        );
        let duplex = self.client.copy_both_simple::<Bytes>(&query).await?;

        info!("Logical replication started on slot {}", self.slot_name);

        Ok(PgTransport {
            duplex: Box::pin(duplex),
            _client: self.client,
            connection_task: self.connection_task,
        })
    }
}

/// Server identity as reported by `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// [`ReplicationTransport`] over a live copy-both session.
pub struct PgTransport {
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    // The duplex only stays usable while the client and its connection
    // task are alive.
    _client: tokio_postgres::Client,
    connection_task: JoinHandle<()>,
}

impl ReplicationTransport for PgTransport {
    async fn recv(&mut self, deadline: Instant) -> Result<Option<Bytes>> {
        match timeout_at(deadline, self.duplex.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(payload))) => Ok(Some(payload)),
            Ok(Some(Err(e))) => Err(Error::Postgres(e)),
            Ok(None) => Err(Error::Connection(
                "replication stream closed by server".to_string(),
            )),
        }
    }

    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.duplex.send(payload).await.map_err(Error::Postgres)?;
        Ok(())
    }
}

impl Drop for PgTransport {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
