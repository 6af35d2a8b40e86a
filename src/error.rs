//! Error types for bike connectivity.

use thiserror::Error;

/// Errors surfaced to callers of the connectivity operations.
///
/// Only transport-fatal conditions and misuse end up here; protocol noise
/// and degraded-but-alive conditions are logged instead.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// The radio has not reached a powered-on state.
    #[error("Bluetooth adapter is not ready")]
    AdapterNotReady,

    /// The transport refused or dropped the connect call.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// Service discovery returned nothing.
    #[error("no GATT services found")]
    NoServicesFound,

    /// Characteristic discovery on the selected service returned nothing.
    #[error("no GATT characteristics found")]
    NoCharacteristicsFound,

    /// The operation needs an open session.
    #[error("not connected")]
    NotConnected,

    /// No device with this id was discovered in the current scan session.
    #[error("device not found with ID: {0}")]
    DeviceNotFound(String),

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A transport operation did not complete in time.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// The session has no characteristic that accepts writes.
    #[error("connected device has no writable characteristic")]
    WriteUnavailable,

    /// Any other transport failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// The manager task is gone.
    #[error("bluetooth manager has stopped")]
    ManagerStopped,
}

/// Result type alias for connectivity operations.
pub type Result<T> = std::result::Result<T, ConnectivityError>;
