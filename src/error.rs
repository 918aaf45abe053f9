//! Error types and result handling for pg-walstream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into a few operational classes: transport failures
//! ([`Error::Postgres`], [`Error::Io`], [`Error::Connection`]) are fatal to
//! the stream and not retried at this layer; protocol violations
//! ([`Error::Protocol`], [`Error::UnknownRelation`],
//! [`Error::InvalidMessage`]) mean the stream can no longer be trusted and
//! the loop halts; [`Error::Decode`] is scoped to a single change event but
//! still halts the loop, because the confirmed position must not advance
//! past an event that was not fully understood. Receive timeouts are not
//! errors at all — they are handled inside the streaming loop.

use thiserror::Error;

/// The main error type for pg-walstream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error from the underlying connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol-level violation in the replication stream, such as an
    /// unexpected top-level frame kind.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A row event referenced a relation id that was never announced via a
    /// relation message. Continuing would risk decoding against the wrong
    /// column layout.
    #[error("Unknown relation ID: {relation_id}")]
    UnknownRelation {
        /// The relation id the row event referenced
        relation_id: u32,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A column payload was malformed for its declared type.
    #[error("Failed to decode column '{column}' (type OID {type_oid}): {message}")]
    Decode {
        /// Name of the offending column
        column: String,
        /// Declared type OID of the column
        type_oid: u32,
        /// Description of the decode failure
        message: String,
    },

    /// A log sequence number string was not in the `X/X` form.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// Operation timeout outside the normal receive deadline, such as the
    /// initial connect.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A convenient Result type alias for pg-walstream operations.
pub type Result<T> = std::result::Result<T, Error>;
