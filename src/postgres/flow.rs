use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::lsn::Lsn;
use super::protocol::StandbyStatusUpdate;

/// Tracks the confirmed log position and decides when a standby status
/// update is due.
///
/// The server retains WAL until the client confirms it, so updates must go
/// out periodically even when the stream is idle. Two things trigger one:
/// the interval deadline passing, and a keepalive with the reply-requested
/// flag set, which arms an immediate send on the next loop iteration. A
/// forced send also resets the periodic deadline — an update just went out,
/// so another timer-driven one inside the same interval would only add
/// chatter.
#[derive(Debug)]
pub struct FlowController {
    confirmed: Lsn,
    interval: Duration,
    deadline: Instant,
    reply_requested: bool,
}

impl FlowController {
    pub fn new(start: Lsn, interval: Duration, now: Instant) -> Self {
        Self {
            confirmed: start,
            interval,
            deadline: now + interval,
            reply_requested: false,
        }
    }

    /// The position the next status update will confirm.
    pub fn confirmed(&self) -> Lsn {
        self.confirmed
    }

    /// When the next receive should give up and let [`tick`](Self::tick)
    /// run.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Record that a WAL-data frame ending at `end` was fully processed.
    ///
    /// Only called after successful processing, so the reported position
    /// never runs ahead of what was actually decoded. Never moves backwards.
    pub fn on_wal_data(&mut self, end: Lsn) {
        if end > self.confirmed {
            self.confirmed = end;
        }
    }

    /// Record a keepalive; a reply request forces a status update on the
    /// next tick regardless of the deadline.
    pub fn on_keepalive(&mut self, reply_requested: bool) {
        if reply_requested {
            self.reply_requested = true;
        }
    }

    /// Emit a status update if one is due, resetting the deadline.
    pub fn tick(&mut self, now: Instant) -> Option<StandbyStatusUpdate> {
        if !self.reply_requested && now < self.deadline {
            return None;
        }
        self.reply_requested = false;
        self.deadline = now + self.interval;

        trace!("standby status update due: confirmed={}", self.confirmed);
        Some(StandbyStatusUpdate::confirming(self.confirmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(10);

    #[test]
    fn no_update_before_deadline() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(5), INTERVAL, now);
        assert!(flow.tick(now).is_none());
        assert!(flow.tick(now + Duration::from_secs(9)).is_none());
    }

    #[test]
    fn update_at_deadline_carries_confirmed_lsn() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(5), INTERVAL, now);
        flow.on_wal_data(Lsn(900));

        let update = flow.tick(now + INTERVAL).unwrap();
        assert_eq!(update.write_lsn, Lsn(900));
        assert_eq!(update.flush_lsn, Lsn(900));
        assert_eq!(update.apply_lsn, Lsn(900));
    }

    #[test]
    fn deadline_resets_after_update() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(0), INTERVAL, now);

        let at = now + INTERVAL;
        assert!(flow.tick(at).is_some());
        assert_eq!(flow.deadline(), at + INTERVAL);
        assert!(flow.tick(at + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn reply_request_forces_immediate_update() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(7), INTERVAL, now);

        flow.on_keepalive(true);
        let update = flow.tick(now + Duration::from_millis(1)).unwrap();
        assert_eq!(update.write_lsn, Lsn(7));

        // Armed once, not latched.
        assert!(flow.tick(now + Duration::from_millis(2)).is_none());
    }

    #[test]
    fn forced_update_resets_periodic_deadline() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(0), INTERVAL, now);

        let at = now + Duration::from_secs(9);
        flow.on_keepalive(true);
        assert!(flow.tick(at).is_some());
        // The old deadline (now + 10s) no longer fires.
        assert!(flow.tick(now + INTERVAL).is_none());
        assert_eq!(flow.deadline(), at + INTERVAL);
    }

    #[test]
    fn keepalive_without_reply_changes_nothing() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(0), INTERVAL, now);
        flow.on_keepalive(false);
        assert!(flow.tick(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn confirmed_never_moves_backwards() {
        let now = Instant::now();
        let mut flow = FlowController::new(Lsn(100), INTERVAL, now);
        flow.on_wal_data(Lsn(50));
        assert_eq!(flow.confirmed(), Lsn(100));
        flow.on_wal_data(Lsn(150));
        assert_eq!(flow.confirmed(), Lsn(150));
    }
}
