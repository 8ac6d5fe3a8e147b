//! Upstream source adapters
//!
//! Two ways events reach the hub:
//!
//! - [`DirectWriter`] - producers submit content, it is appended to the
//!   journal and then fanned out with its assigned offset
//! - [`CdcSubscriber`] - change records are consumed from an upstream stream
//!   and relayed as-is

mod config;
mod direct;
#[cfg(feature = "kafka")]
mod kafka;
mod subscribe;

use thiserror::Error;

use crate::journal::JournalError;

pub use config::UpstreamConfig;
pub use direct::DirectWriter;
#[cfg(feature = "kafka")]
pub use kafka::KafkaStream;
pub use subscribe::{CdcSubscriber, SubscriberStats, UpstreamStream, parse_record};

/// Errors from submitting content
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Failed to persist message: {0}")]
    PersistFailure(#[source] JournalError),
}

/// Errors from an upstream change stream
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Upstream connection lost: {0}")]
    ConnectionLost(String),

    #[error("Malformed upstream record: {0}")]
    MalformedRecord(String),
}
