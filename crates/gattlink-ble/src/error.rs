//! Error types for the btleplug session

use gattlink_core::SessionError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures inside the btleplug driver
#[derive(Error, Debug)]
pub enum BleSessionError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("No BLE adapter at index {index} ({available} found)")]
    NoSuchAdapter { index: usize, available: usize },

    #[error("Peripheral not found: {peripheral_id}")]
    PeripheralNotFound { peripheral_id: String },

    #[error("Invalid peripheral identifier {peripheral_id}: {reason}")]
    InvalidPeripheralId {
        peripheral_id: String,
        reason: String,
    },

    #[error("Service not found: {service}")]
    ServiceNotFound { service: uuid::Uuid },

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: uuid::Uuid },

    #[error("RSSI not reported by the peripheral")]
    RssiUnavailable,

    #[error("Driver task stopped")]
    DriverStopped,

    #[error("btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

pub type Result<T> = std::result::Result<T, BleSessionError>;

impl From<BleSessionError> for SessionError {
    fn from(err: BleSessionError) -> Self {
        match err {
            BleSessionError::AdapterNotAvailable
            | BleSessionError::NoSuchAdapter { .. }
            | BleSessionError::DriverStopped => SessionError::AdapterUnavailable,
            BleSessionError::PeripheralNotFound { peripheral_id }
            | BleSessionError::InvalidPeripheralId { peripheral_id, .. } => {
                SessionError::UnknownPeripheral { peripheral_id }
            }
            other => SessionError::Backend(other.to_string()),
        }
    }
}
