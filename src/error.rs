//! Error types for the ble-battery-session crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Only requests made directly by the caller return these errors. Failures
/// that happen while a connection is in flight are absorbed by the session
/// and surface as a terminal connection state instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is off, or BLE is not supported on this system.
    #[error("Bluetooth transport not available or disabled")]
    TransportUnavailable,

    /// The requested address can no longer be resolved to a peripheral.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// The session has been closed and no longer accepts requests.
    #[error("Session closed")]
    SessionClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
