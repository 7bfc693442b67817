//! Data structures observed by the presentation layer.
//!
//! This module contains the discovered-device types and the session
//! snapshot published on every state change.

pub mod devices;
pub mod snapshot;

pub use devices::{DiscoveredDevice, ScanResults, UNKNOWN_DEVICE_NAME};
pub use snapshot::SessionSnapshot;
