//! The streaming receive-decode-acknowledge loop.
//!
//! One loop per stream, one task of control: each iteration checks the
//! cooperative stop flag, lets the flow controller send a status update if
//! one is due, then blocks on the transport until the flow deadline. A
//! deadline lapse is a normal wake-up, not an error; a frame is demuxed,
//! decoded, handed to the event sink, and only then is the confirmed
//! position advanced. The loop runs until stopped or until the stream hits
//! an unrecoverable condition, which is returned to the caller so it can
//! decide whether to restart from the last confirmed position.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::decoder::PgOutputDecoder;
use super::flow::FlowController;
use super::lsn::Lsn;
use super::protocol::{parse_copy_data, CopyDataFrame};
use super::relation::RelationCache;
use super::types::ChangeEvent;
use crate::Result;

/// Byte-level access to an established replication session.
///
/// The session setup (connection, authentication, `START_REPLICATION`) is
/// someone else's job; this trait is only the two operations the loop
/// needs: a deadline-bounded receive of one copy-data payload and a send of
/// one copy-data payload.
#[allow(async_fn_in_trait)]
pub trait ReplicationTransport {
    /// Receive the next copy-data payload. `Ok(None)` means the deadline
    /// passed first, which is an expected outcome, not a failure.
    async fn recv(&mut self, deadline: Instant) -> Result<Option<Bytes>>;

    /// Send one copy-data payload (a standby status update).
    async fn send(&mut self, payload: Bytes) -> Result<()>;
}

/// Where decoded events go.
pub trait EventSink {
    /// Handle one decoded event. An error halts the stream without
    /// confirming the event's bytes.
    fn handle(&mut self, event: ChangeEvent) -> Result<()>;
}

impl<F> EventSink for F
where
    F: FnMut(ChangeEvent) -> Result<()>,
{
    fn handle(&mut self, event: ChangeEvent) -> Result<()> {
        self(event)
    }
}

/// Requests a graceful stop of a [`StreamingLoop`].
///
/// The loop notices the request at its next iteration boundary, before
/// starting another receive, so no partially processed frame is lost.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// The decode-and-acknowledge engine for one replication stream.
pub struct StreamingLoop<T, S> {
    transport: T,
    sink: S,
    decoder: PgOutputDecoder,
    relations: RelationCache,
    flow: FlowController,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<T, S> StreamingLoop<T, S>
where
    T: ReplicationTransport,
    S: EventSink,
{
    /// Build a loop starting at `start`, acknowledging on `status_interval`.
    pub fn new(
        transport: T,
        sink: S,
        decoder: PgOutputDecoder,
        start: Lsn,
        status_interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            transport,
            sink,
            decoder,
            relations: RelationCache::new(),
            flow: FlowController::new(start, status_interval, Instant::now()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Handle used to stop the loop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// The last position confirmed (or about to be confirmed) to the
    /// server. After a clean stop this is the position a restarted stream
    /// should resume from.
    pub fn confirmed_lsn(&self) -> Lsn {
        self.flow.confirmed()
    }

    /// Run until stopped or until the stream fails.
    pub async fn run(&mut self) -> Result<()> {
        debug!(
            "replication stream loop starting at {}",
            self.flow.confirmed()
        );

        loop {
            if *self.stop_rx.borrow() {
                debug!("stop requested, leaving replication loop");
                return Ok(());
            }

            if let Some(update) = self.flow.tick(Instant::now()) {
                trace!("sending standby status update: {}", update.write_lsn);
                self.transport.send(update.encode()).await?;
            }

            match self.transport.recv(self.flow.deadline()).await? {
                // Deadline lapsed; the next pass ticks the flow controller.
                None => continue,
                Some(payload) => self.handle_frame(payload)?,
            }
        }
    }

    fn handle_frame(&mut self, payload: Bytes) -> Result<()> {
        match parse_copy_data(payload)? {
            CopyDataFrame::Keepalive(keepalive) => {
                trace!(
                    "keepalive: wal_end={} reply_requested={}",
                    keepalive.wal_end,
                    keepalive.reply_requested
                );
                self.flow.on_keepalive(keepalive.reply_requested);
            }
            CopyDataFrame::XLogData(xlog) => {
                let end = xlog.end_position();
                let event = self.decoder.decode(&mut self.relations, &xlog.data)?;
                self.sink.handle(event)?;
                self.flow.on_wal_data(end);
            }
        }
        Ok(())
    }
}
