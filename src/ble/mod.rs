//! BLE transport module.
//!
//! This module provides the transport abstraction the session drives,
//! a native implementation over the host Bluetooth stack and a simulated
//! one for demos and tests.

pub mod connection;
pub mod native;
pub mod simulated;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionState, SessionState};
pub use native::NativeTransport;
pub use simulated::{demo_peripherals, SimulatedPeripheral, SimulatedTiming, SimulatedTransport};
pub use transport::{
    status, BondState, LinkError, LinkHandle, LinkState, Transport, TransportEvent,
};
pub use uuids::*;
