pub mod config;
pub mod error;
pub mod replicator;

pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
