//! Read-only view of a session.

use crate::ble::connection::ConnectionState;
use crate::data::devices::DiscoveredDevice;

/// Everything a presentation layer needs to render the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionSnapshot {
    /// Scan results, strongest signal first.
    pub devices: Vec<DiscoveredDevice>,
    /// Collapsed connection state.
    pub connection_state: ConnectionState,
    /// Battery level in percent, once read.
    pub battery_level: Option<u8>,
    /// Whether a scan is running.
    pub is_scanning: bool,
}

impl SessionSnapshot {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }
}
