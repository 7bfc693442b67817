// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-battery-session
//!
//! A small Rust library that scans for Bluetooth Low Energy peripherals,
//! connects to one, bonds with it when required and reads the standard
//! Battery Level characteristic.
//!
//! ## Features
//!
//! - **Discovery**: Deduplicated scan results ordered by signal strength
//! - **Bonding**: Bonds before opening a link when the peripheral is unbonded
//! - **Battery Level**: Reads the Battery Service (0x180F / 0x2A19)
//! - **Failure Classification**: Configurable mapping of link statuses
//! - **Observable State**: Snapshots published through a watch channel
//! - **Simulation**: A simulated transport for demos and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_battery_session::{ConnectionSession, NativeTransport, Result, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Open the adapter and start scanning
//!     let transport = Arc::new(NativeTransport::new().await?);
//!     let session = ConnectionSession::new(transport, SessionConfig::default())?;
//!     session.start_scan()?;
//!
//!     // Wait for peripherals to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Connect to the strongest one
//!     let snapshot = session.snapshot();
//!     if let Some(device) = snapshot.devices.first() {
//!         println!("Connecting to {} ({})", device.display_name(), device.address);
//!         session.connect_device(device)?;
//!     }
//!
//!     let mut updates = session.subscribe();
//!     let snapshot = updates
//!         .wait_for(|s| s.battery_level.is_some() || !s.connection_state.is_transitioning())
//!         .await
//!         .map(|s| s.clone())
//!         .unwrap_or_default();
//!
//!     if let Some(level) = snapshot.battery_level {
//!         println!("Battery: {}%", level);
//!     }
//!
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//! Pairing is handled by the host when a protected attribute is read.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::{FailureClassifier, FailureOutcome, SessionConfig, DEFAULT_SCAN_TIMEOUT};
pub use error::{Error, Result};
pub use session::{ConnectionSession, SessionMachine};
pub use utils::parse_battery_level;

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionState, SessionState};
pub use ble::native::NativeTransport;
pub use ble::simulated::{SimulatedPeripheral, SimulatedTiming, SimulatedTransport};
pub use ble::transport::{BondState, LinkError, LinkHandle, LinkState, Transport, TransportEvent};
pub use data::{DiscoveredDevice, ScanResults, SessionSnapshot};
