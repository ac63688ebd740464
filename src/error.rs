//! Error taxonomy for the broker.
//!
//! Every fallible broker, device-session and client-session operation returns
//! [`BrokerError`]. Failures reported by the hardware collaborator arrive as
//! [`HardwareError`] and are wrapped, except for an unknown camera id which is
//! surfaced as [`BrokerError::NotFound`].
//!
//! A weak reference that no longer resolves is never an error: the session on
//! the other side is mid-teardown and the operation becomes a no-op.

use std::time::Duration;

use thiserror::Error;

use crate::hardware::HardwareError;

/// Convenience alias for results using the broker error type.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("camera {0} not found")]
    NotFound(String),

    #[error("camera {0} is busy")]
    Busy(String),

    #[error("stream is already running")]
    StreamAlreadyRunning,

    #[error("master role on {0} is held by another client")]
    AlreadyMastered(String),

    /// A request that was understood but refused: a parameter write from a
    /// client that is not master (carrying the value currently in effect), or
    /// a buffer quota the hardware could not grant.
    #[error("request rejected: {reason}")]
    Rejected {
        reason: &'static str,
        current: Option<i32>,
    },

    #[error("hardware error: {0}")]
    Hardware(HardwareError),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("caller is not authorized")]
    PermissionDenied,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("usage scheduler is not running")]
    SchedulerStopped,
}

impl BrokerError {
    pub(crate) fn rejected(reason: &'static str) -> Self {
        Self::Rejected {
            reason,
            current: None,
        }
    }
}

impl From<HardwareError> for BrokerError {
    fn from(value: HardwareError) -> Self {
        match value {
            HardwareError::NoSuchCamera(id) => BrokerError::NotFound(id),
            other => BrokerError::Hardware(other),
        }
    }
}
