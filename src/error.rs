//! Error types for the fan control core.

use std::io;

use thiserror::Error;

use crate::drivers::PlatformId;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("no EC driver matches platform {platform:?} ({version})")]
    DriverUnavailable { platform: PlatformId, version: String },

    #[error("EC driver {name:?} is not registered or does not match this platform")]
    UnknownDriver { name: String },

    #[error("EC driver {name} failed to initialize: {source}")]
    DriverInit {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("fan control is already running")]
    AlreadyRunning,

    #[error("fan control is not running")]
    NotRunning,

    #[error("no fan at index {index} (configured fans: {count})")]
    UnknownFan { index: usize, count: usize },

    #[error("EC bus lock not acquired within {timeout_ms} ms")]
    BusBusy { timeout_ms: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
