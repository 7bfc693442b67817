//! Simulated transport.
//!
//! Stands in for a real BLE stack in demo mode and in tests. Peripherals,
//! their bond state, battery level and link behaviour are configured up
//! front; every operation completes after a configurable delay.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::ble::transport::{
    status, BondState, LinkError, LinkHandle, LinkState, Transport, TransportEvent,
};
use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::error::{Error, Result};

/// A peripheral known to the simulated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedPeripheral {
    /// Advertised name.
    pub name: Option<String>,
    /// Address.
    pub address: String,
    /// Signal strength reported on discovery.
    pub rssi: i16,
    /// Bond state before any bonding.
    pub bond_state: BondState,
    /// Whether bonding succeeds.
    pub bond_succeeds: bool,
    /// Battery level; `None` means no battery service.
    pub battery_level: Option<u8>,
    /// If set, opening a link fails with this status.
    pub link_failure: Option<LinkError>,
}

impl SimulatedPeripheral {
    /// A bonded peripheral with a battery service.
    pub fn new(name: &str, address: &str, rssi: i16, battery_level: u8) -> Self {
        Self {
            name: Some(name.to_string()),
            address: address.to_string(),
            rssi,
            bond_state: BondState::Bonded,
            bond_succeeds: true,
            battery_level: Some(battery_level),
            link_failure: None,
        }
    }

    /// Set the initial bond state.
    pub fn with_bond_state(mut self, bond_state: BondState) -> Self {
        self.bond_state = bond_state;
        self
    }

    /// Make bonding fail.
    pub fn with_failing_bond(mut self) -> Self {
        self.bond_succeeds = false;
        self
    }

    /// Remove the battery service.
    pub fn without_battery(mut self) -> Self {
        self.battery_level = None;
        self
    }

    /// Make link establishment fail.
    pub fn with_link_failure(mut self, error: LinkError) -> Self {
        self.link_failure = Some(error);
        self
    }
}

/// The canned peripherals shown in demo mode.
pub fn demo_peripherals() -> Vec<SimulatedPeripheral> {
    vec![
        SimulatedPeripheral::new("Fitness Tracker Pro", "AA:BB:CC:DD:EE:01", -50, 32),
        SimulatedPeripheral::new("Smart Watch X1", "AA:BB:CC:DD:EE:02", -65, 32),
        SimulatedPeripheral::new("Heart Rate Monitor", "AA:BB:CC:DD:EE:03", -75, 32),
    ]
}

/// Delays applied by the simulated transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedTiming {
    /// From scan start to discovery of all peripherals.
    pub discovery: Duration,
    /// From bonding start to its result.
    pub bonding: Duration,
    /// From link open to link up (or failure).
    pub connect: Duration,
    /// Service discovery.
    pub service_discovery: Duration,
    /// Battery level read.
    pub read: Duration,
}

impl SimulatedTiming {
    /// Every operation completes on the next scheduler tick.
    pub const fn immediate() -> Self {
        Self {
            discovery: Duration::ZERO,
            bonding: Duration::ZERO,
            connect: Duration::ZERO,
            service_discovery: Duration::ZERO,
            read: Duration::ZERO,
        }
    }
}

impl Default for SimulatedTiming {
    fn default() -> Self {
        Self {
            discovery: Duration::from_millis(1500),
            bonding: Duration::from_millis(1000),
            connect: Duration::from_millis(2000),
            service_discovery: Duration::from_millis(100),
            read: Duration::from_millis(500),
        }
    }
}

/// State shared with delayed completions.
struct Shared {
    peripherals: RwLock<Vec<SimulatedPeripheral>>,
    bonds: RwLock<HashMap<String, BondState>>,
    links: RwLock<HashMap<LinkHandle, String>>,
    scanning: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        trace!("Simulated event: {:?}", event);
        let _ = self.event_tx.send(event);
    }

    fn peripheral(&self, address: &str) -> Option<SimulatedPeripheral> {
        self.peripherals
            .read()
            .iter()
            .find(|p| p.address == address)
            .cloned()
    }

    fn link_address(&self, link: LinkHandle) -> Option<String> {
        self.links.read().get(&link).cloned()
    }
}

/// A [`Transport`] backed by configured peripherals instead of a radio.
pub struct SimulatedTransport {
    shared: Arc<Shared>,
    timing: SimulatedTiming,
    ready: AtomicBool,
    next_link: AtomicU64,
    runtime: Handle,
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedTransport {
    /// Create a simulated transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when called outside a Tokio runtime.
    pub fn new(peripherals: Vec<SimulatedPeripheral>, timing: SimulatedTiming) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no Tokio runtime: {}", e)))?;
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                peripherals: RwLock::new(peripherals),
                bonds: RwLock::new(HashMap::new()),
                links: RwLock::new(HashMap::new()),
                scanning: AtomicBool::new(false),
                event_tx,
            }),
            timing,
            ready: AtomicBool::new(true),
            next_link: AtomicU64::new(1),
            runtime,
            scan_handle: Mutex::new(None),
        })
    }

    /// The demo transport: canned peripherals with default delays.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when called outside a Tokio runtime.
    pub fn demo() -> Result<Self> {
        Self::new(demo_peripherals(), SimulatedTiming::default())
    }

    /// Power the simulated radio on or off.
    pub fn set_ready(&self, ready: bool) {
        if self.ready.swap(ready, Ordering::SeqCst) != ready {
            debug!("Simulated radio ready: {}", ready);
            if !ready {
                self.shared.scanning.store(false, Ordering::SeqCst);
                self.shared.links.write().clear();
            }
            self.shared.emit(TransportEvent::AdapterStateChanged { ready });
        }
    }

    /// Add a peripheral, or replace the one with the same address.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut peripherals = self.shared.peripherals.write();
        peripherals.retain(|p| p.address != peripheral.address);
        peripherals.push(peripheral);
    }

    /// Make a peripheral go out of range: its links drop.
    pub fn drop_peripheral(&self, address: &str) {
        self.shared.peripherals.write().retain(|p| p.address != address);

        let dropped: Vec<LinkHandle> = {
            let mut links = self.shared.links.write();
            let dropped = links
                .iter()
                .filter(|(_, a)| a.as_str() == address)
                .map(|(link, _)| *link)
                .collect::<Vec<_>>();
            for link in &dropped {
                links.remove(link);
            }
            dropped
        };

        for link in dropped {
            self.shared.emit(TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Disconnected,
                error: Some(LinkError::new(
                    status::CONNECTION_TIMEOUT,
                    "peripheral out of range",
                )),
            });
        }
    }

    /// Number of links not yet closed.
    pub fn open_links(&self) -> usize {
        self.shared.links.read().len()
    }

    /// Run `complete` after `delay`.
    fn after(
        &self,
        delay: Duration,
        complete: impl FnOnce(&Shared) + Send + 'static,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            complete(&shared);
        })
    }
}

impl Transport for SimulatedTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn start_scan(&self) {
        if self.shared.scanning.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self.after(self.timing.discovery, |shared| {
            if !shared.scanning.load(Ordering::SeqCst) {
                return;
            }
            let peripherals = shared.peripherals.read().clone();
            for p in peripherals {
                shared.emit(TransportEvent::DeviceDiscovered {
                    address: p.address,
                    name: p.name,
                    rssi: Some(p.rssi),
                    simulated: true,
                });
            }
            // Every simulated peripheral has been reported.
            shared.scanning.store(false, Ordering::SeqCst);
            shared.emit(TransportEvent::ScanCompleted);
        });

        if let Some(previous) = self.scan_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_scan(&self) {
        self.shared.scanning.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scan_handle.lock().take() {
            handle.abort();
        }
    }

    fn bond_state(&self, address: &str) -> Result<BondState> {
        let peripheral = self
            .shared
            .peripheral(address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        Ok(self
            .shared
            .bonds
            .read()
            .get(address)
            .copied()
            .unwrap_or(peripheral.bond_state))
    }

    fn initiate_bond(&self, address: &str) {
        let address = address.to_string();
        self.shared
            .bonds
            .write()
            .insert(address.clone(), BondState::Bonding);

        self.after(self.timing.bonding, move |shared| {
            let state = match shared.peripheral(&address) {
                Some(p) if p.bond_succeeds => BondState::Bonded,
                _ => BondState::Unbonded,
            };
            shared.bonds.write().insert(address.clone(), state);
            shared.emit(TransportEvent::BondStateChanged { address, state });
        });
    }

    fn open_link(&self, address: &str) -> Result<LinkHandle> {
        let peripheral = self
            .shared
            .peripheral(address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        let link = LinkHandle::new(self.next_link.fetch_add(1, Ordering::SeqCst));
        self.shared
            .links
            .write()
            .insert(link, peripheral.address.clone());

        self.after(self.timing.connect, move |shared| {
            if shared.link_address(link).is_none() {
                return;
            }
            let event = match peripheral.link_failure {
                Some(error) => {
                    shared.links.write().remove(&link);
                    TransportEvent::LinkStateChanged {
                        link,
                        state: LinkState::Disconnected,
                        error: Some(error),
                    }
                }
                None => TransportEvent::LinkStateChanged {
                    link,
                    state: LinkState::Connected,
                    error: None,
                },
            };
            shared.emit(event);
        });

        Ok(link)
    }

    fn discover_battery_service(&self, link: LinkHandle) {
        self.after(self.timing.service_discovery, move |shared| {
            let Some(address) = shared.link_address(link) else {
                return;
            };
            let found = shared
                .peripheral(&address)
                .map(|p| p.battery_level.is_some())
                .unwrap_or(false);
            shared.emit(TransportEvent::ServiceDiscovered { link, found });
        });
    }

    fn read_battery_level(&self, link: LinkHandle) {
        self.after(self.timing.read, move |shared| {
            let Some(address) = shared.link_address(link) else {
                return;
            };
            let event = match shared.peripheral(&address).and_then(|p| p.battery_level) {
                Some(level) => TransportEvent::CharacteristicValue {
                    link,
                    bytes: Bytes::copy_from_slice(&[level]),
                },
                None => TransportEvent::OperationFailed {
                    link,
                    error: LinkError::new(status::GATT_ERROR, "no battery characteristic"),
                },
            };
            shared.emit(event);
        });
    }

    fn disconnect(&self, link: LinkHandle) {
        if self.shared.link_address(link).is_some() {
            self.shared.emit(TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Disconnected,
                error: None,
            });
        }
    }

    fn close_link(&self, link: LinkHandle) {
        if self.shared.links.write().remove(&link).is_some() {
            debug!("Closed simulated {}", link);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.event_tx.subscribe()
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_scan_reports_all_peripherals() {
        let transport = SimulatedTransport::new(demo_peripherals(), SimulatedTiming::immediate())
            .unwrap();
        let mut rx = transport.subscribe();

        transport.start_scan();

        let mut addresses = Vec::new();
        for _ in 0..3 {
            match next_event(&mut rx).await {
                TransportEvent::DeviceDiscovered {
                    address, simulated, ..
                } => {
                    assert!(simulated);
                    addresses.push(address);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(next_event(&mut rx).await, TransportEvent::ScanCompleted);
        assert_eq!(
            addresses,
            vec![
                "AA:BB:CC:DD:EE:01",
                "AA:BB:CC:DD:EE:02",
                "AA:BB:CC:DD:EE:03"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let transport = SimulatedTransport::new(Vec::new(), SimulatedTiming::immediate()).unwrap();
        assert!(matches!(
            transport.bond_state("nope"),
            Err(Error::DeviceNotFound { .. })
        ));
        assert!(transport.open_link("nope").is_err());
    }

    #[tokio::test]
    async fn test_bonding_outcomes() {
        let transport = SimulatedTransport::new(
            vec![
                SimulatedPeripheral::new("Good", "A", -40, 50).with_bond_state(BondState::Unbonded),
                SimulatedPeripheral::new("Bad", "B", -40, 50)
                    .with_bond_state(BondState::Unbonded)
                    .with_failing_bond(),
            ],
            SimulatedTiming::immediate(),
        )
        .unwrap();
        let mut rx = transport.subscribe();

        transport.initiate_bond("A");
        assert_eq!(transport.bond_state("A").unwrap(), BondState::Bonding);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::BondStateChanged {
                address: "A".to_string(),
                state: BondState::Bonded,
            }
        );
        assert_eq!(transport.bond_state("A").unwrap(), BondState::Bonded);

        transport.initiate_bond("B");
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::BondStateChanged {
                address: "B".to_string(),
                state: BondState::Unbonded,
            }
        );
    }

    #[tokio::test]
    async fn test_link_lifecycle() {
        let transport = SimulatedTransport::new(demo_peripherals(), SimulatedTiming::immediate())
            .unwrap();
        let mut rx = transport.subscribe();

        let link = transport.open_link("AA:BB:CC:DD:EE:01").unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Connected,
                error: None,
            }
        );

        transport.discover_battery_service(link);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::ServiceDiscovered { link, found: true }
        );

        transport.read_battery_level(link);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::CharacteristicValue {
                link,
                bytes: Bytes::from_static(&[32]),
            }
        );

        transport.close_link(link);
        transport.close_link(link);
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_link_failure() {
        let error = LinkError::new(status::GATT_ERROR, "refused");
        let transport = SimulatedTransport::new(
            vec![SimulatedPeripheral::new("X", "X", -40, 10).with_link_failure(error.clone())],
            SimulatedTiming::immediate(),
        )
        .unwrap();
        let mut rx = transport.subscribe();

        let link = transport.open_link("X").unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Disconnected,
                error: Some(error),
            }
        );
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_set_ready() {
        let transport = SimulatedTransport::demo().unwrap();
        let mut rx = transport.subscribe();

        transport.set_ready(false);
        assert!(!transport.is_ready());
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::AdapterStateChanged { ready: false }
        );

        transport.set_ready(true);
        assert!(transport.is_ready());
    }
}
