//! The transport contract between the session and a BLE stack.
//!
//! A transport wraps whatever the host offers for scanning, bonding and
//! GATT access. Every operation returns immediately; outcomes are delivered
//! on a single broadcast channel of [`TransportEvent`]s that the session
//! subscribes to once.

use bytes::Bytes;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;

/// Status codes carried by link failures.
///
/// These follow the HCI error codes used by most host stacks, plus the
/// generic GATT failure some platforms report instead of a precise reason.
pub mod status {
    /// The peripheral stopped responding.
    pub const CONNECTION_TIMEOUT: u16 = 0x08;
    /// The peripheral closed the link.
    pub const REMOTE_USER_TERMINATED: u16 = 0x13;
    /// This host closed the link.
    pub const LOCAL_HOST_TERMINATED: u16 = 0x16;
    /// The link could not be set up.
    pub const CONNECTION_FAILED_TO_ESTABLISH: u16 = 0x3e;
    /// Unspecified GATT failure.
    pub const GATT_ERROR: u16 = 0x85;
}

/// Opaque handle to an open (or opening) link, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkHandle(u64);

impl LinkHandle {
    /// Wrap a raw transport-assigned identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Bond (pairing) state of a peripheral as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BondState {
    /// No bond exists. Also reported when bonding fails or is cancelled.
    Unbonded,
    /// A bonding procedure is running.
    Bonding,
    /// Keys have been exchanged and stored.
    Bonded,
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbonded => write!(f, "Unbonded"),
            Self::Bonding => write!(f, "Bonding"),
            Self::Bonded => write!(f, "Bonded"),
        }
    }
}

/// Link-level state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// The link is up.
    Connected,
    /// The link is down, or never came up.
    Disconnected,
}

/// Failure status attached to a link event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkError {
    /// Numeric status, see [`status`].
    pub status: u16,
    /// Human-readable detail from the host stack.
    pub message: String,
}

impl LinkError {
    /// Create a new link error.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {:#04x}: {}", self.status, self.message)
    }
}

/// Everything a transport can report to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peripheral was seen during a scan.
    DeviceDiscovered {
        /// Platform address (MAC on most hosts, a UUID on Apple platforms).
        address: String,
        /// Advertised or cached name.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
        /// Whether the peripheral is simulated.
        simulated: bool,
    },
    /// The bond state of a peripheral changed.
    BondStateChanged {
        /// Address of the peripheral.
        address: String,
        /// The new bond state.
        state: BondState,
    },
    /// A link came up or went down.
    LinkStateChanged {
        /// The link the event refers to.
        link: LinkHandle,
        /// The new link state.
        state: LinkState,
        /// Explicit failure status, if the host reported one.
        error: Option<LinkError>,
    },
    /// Battery service discovery finished.
    ServiceDiscovered {
        /// The link the event refers to.
        link: LinkHandle,
        /// Whether the battery service and its level characteristic exist.
        found: bool,
    },
    /// A battery level read completed.
    CharacteristicValue {
        /// The link the event refers to.
        link: LinkHandle,
        /// Raw characteristic value.
        bytes: Bytes,
    },
    /// Service discovery or a characteristic read failed on an open link.
    OperationFailed {
        /// The link the event refers to.
        link: LinkHandle,
        /// Failure status.
        error: LinkError,
    },
    /// The transport finished scanning on its own.
    ScanCompleted,
    /// The host could not start or continue a scan.
    ScanFailed {
        /// Host-specific failure code.
        code: i32,
    },
    /// The radio was powered on or off.
    AdapterStateChanged {
        /// Whether the transport can be used.
        ready: bool,
    },
    /// The transport hit a failure it cannot recover from.
    TransportError {
        /// Description of the failure.
        message: String,
    },
}

/// Operations a BLE stack must offer to drive a battery-reading session.
///
/// Implementations must not block: anything that takes time is started and
/// its outcome reported later through [`Transport::subscribe`].
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Whether the radio is on and BLE is supported.
    fn is_ready(&self) -> bool;

    /// Start scanning. Idempotent; failures arrive as [`TransportEvent::ScanFailed`].
    fn start_scan(&self);

    /// Stop scanning. Idempotent.
    fn stop_scan(&self);

    /// Current bond state of a peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DeviceNotFound`] if the address cannot be resolved.
    fn bond_state(&self, address: &str) -> Result<BondState>;

    /// Start bonding. The result arrives as [`TransportEvent::BondStateChanged`].
    fn initiate_bond(&self, address: &str);

    /// Start opening a link. The result arrives as [`TransportEvent::LinkStateChanged`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DeviceNotFound`] if the address cannot be resolved.
    fn open_link(&self, address: &str) -> Result<LinkHandle>;

    /// Look for the battery service. The result arrives as [`TransportEvent::ServiceDiscovered`].
    fn discover_battery_service(&self, link: LinkHandle);

    /// Read the battery level. The result arrives as [`TransportEvent::CharacteristicValue`].
    fn read_battery_level(&self, link: LinkHandle);

    /// Ask the host to drop the link. Completion arrives as a
    /// [`LinkState::Disconnected`] event.
    fn disconnect(&self, link: LinkHandle);

    /// Release the link handle. Synchronous and idempotent.
    fn close_link(&self, link: LinkHandle);

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
