//! Copy-data frame layer of the replication stream.
//!
//! After replication starts, every frame the server sends is a copy-data
//! payload whose first byte says what it carries: `k` for a primary
//! keepalive, `w` for WAL data wrapping one logical message. The client
//! talks back on the same channel with `r` standby status updates.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::lsn::Lsn;
use crate::{Error, Result};

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';

/// PostgreSQL epoch (2000-01-01T00:00:00Z) in microseconds since the Unix
/// epoch. Wire timestamps count microseconds from here.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert a wire timestamp to a wall-clock time.
pub fn pg_time_to_utc(pg_micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(pg_micros + PG_EPOCH_MICROS).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Current wall-clock time as a wire timestamp.
pub fn now_pg_micros() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_MICROS
}

/// A primary keepalive: the server's heartbeat, optionally demanding an
/// immediate status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keepalive {
    /// Server's current end-of-WAL position.
    pub wal_end: Lsn,
    /// Server clock when the message was sent.
    pub server_time_micros: i64,
    /// True when the server wants a standby status update now.
    pub reply_requested: bool,
}

/// A WAL-data frame: header plus one logical-message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    /// WAL position where this payload starts.
    pub wal_start: Lsn,
    /// Server's current end-of-WAL position.
    pub wal_end: Lsn,
    /// Server clock when the message was sent.
    pub server_time_micros: i64,
    /// The logical replication message, handed on to the message decoder.
    pub data: Bytes,
}

impl XLogData {
    /// Position just past this frame's payload; what the client confirms
    /// once the frame is fully processed.
    pub fn end_position(&self) -> Lsn {
        self.wal_start + self.data.len() as u64
    }
}

/// One inbound copy-data frame, demultiplexed by its tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDataFrame {
    Keepalive(Keepalive),
    XLogData(XLogData),
}

/// Split an inbound copy-data payload into keepalive or WAL data.
///
/// Anything other than the two known tags is a hard error: after
/// replication start the protocol admits nothing else on this channel.
pub fn parse_copy_data(payload: Bytes) -> Result<CopyDataFrame> {
    if payload.is_empty() {
        return Err(Error::Protocol("empty copy-data payload".to_string()));
    }

    let mut cursor = payload;
    let tag = cursor.get_u8();

    match tag {
        KEEPALIVE_TAG => {
            // wal_end(8) + server_time(8) + reply_requested(1)
            if cursor.remaining() < 17 {
                return Err(Error::InvalidMessage {
                    message: format!("keepalive too short: {} bytes", cursor.remaining()),
                });
            }
            let wal_end = Lsn(cursor.get_u64());
            let server_time_micros = cursor.get_i64();
            let reply_requested = cursor.get_u8() != 0;

            Ok(CopyDataFrame::Keepalive(Keepalive {
                wal_end,
                server_time_micros,
                reply_requested,
            }))
        }
        XLOG_DATA_TAG => {
            // wal_start(8) + wal_end(8) + server_time(8) + payload
            if cursor.remaining() < 24 {
                return Err(Error::InvalidMessage {
                    message: format!("XLogData header too short: {} bytes", cursor.remaining()),
                });
            }
            let wal_start = Lsn(cursor.get_u64());
            let wal_end = Lsn(cursor.get_u64());
            let server_time_micros = cursor.get_i64();
            let data = cursor.copy_to_bytes(cursor.remaining());

            Ok(CopyDataFrame::XLogData(XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            }))
        }
        other => Err(Error::Protocol(format!(
            "unexpected copy-data tag: 0x{:02x} ('{}')",
            other, other as char
        ))),
    }
}

/// The client's acknowledgment frame: how much WAL it has durably consumed.
///
/// This client has no separate flush/apply pipeline, so all three position
/// fields carry the same confirmed LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
    pub client_time_micros: i64,
    /// Ask the server to answer with a keepalive.
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Status update confirming `confirmed` at the current wall clock.
    pub fn confirming(confirmed: Lsn) -> Self {
        Self {
            write_lsn: confirmed,
            flush_lsn: confirmed,
            apply_lsn: confirmed,
            client_time_micros: now_pg_micros(),
            reply_requested: false,
        }
    }

    /// Wire encoding: tag + three LSNs + client clock + reply flag.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STATUS_UPDATE_TAG);
        buf.put_u64(self.write_lsn.0);
        buf.put_u64(self.flush_lsn.0);
        buf.put_u64(self.apply_lsn.0);
        buf.put_i64(self.client_time_micros);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }

    /// Inverse of [`encode`](Self::encode); the server-side view, used by
    /// the test harness.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = payload;
        if cursor.remaining() < 34 {
            return Err(Error::InvalidMessage {
                message: format!("status update too short: {} bytes", cursor.remaining()),
            });
        }
        let tag = cursor.get_u8();
        if tag != STATUS_UPDATE_TAG {
            return Err(Error::Protocol(format!(
                "unexpected status update tag: 0x{:02x}",
                tag
            )));
        }
        Ok(Self {
            write_lsn: Lsn(cursor.get_u64()),
            flush_lsn: Lsn(cursor.get_u64()),
            apply_lsn: Lsn(cursor.get_u64()),
            client_time_micros: cursor.get_i64(),
            reply_requested: cursor.get_u8() != 0,
        })
    }
}
