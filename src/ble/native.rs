//! Transport backed by the host BLE stack through btleplug.
//!
//! btleplug exposes no bonding API: the host pairs on demand when a
//! protected attribute is accessed. Known peripherals therefore report
//! [`BondState::Bonded`] and bonding completes immediately.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::transport::{
    status, BondState, LinkError, LinkHandle, LinkState, Transport, TransportEvent,
};
use crate::ble::uuids::{is_battery_level_characteristic, is_battery_service};
use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::error::{Error, Result};

/// Scan failure code used when the host gives no reason.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

/// An open (or opening) link.
struct OpenLink {
    peripheral: Peripheral,
    battery_level: Option<Characteristic>,
}

/// State shared with the adapter event task and operation tasks.
struct Shared {
    adapter: Adapter,
    ready: AtomicBool,
    scanning: AtomicBool,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    links: RwLock<HashMap<LinkHandle, OpenLink>>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    fn link_peripheral(&self, link: LinkHandle) -> Option<Peripheral> {
        self.links.read().get(&link).map(|l| l.peripheral.clone())
    }

    fn is_open(&self, link: LinkHandle) -> bool {
        self.links.read().contains_key(&link)
    }
}

/// A [`Transport`] over the first Bluetooth adapter of the host.
pub struct NativeTransport {
    shared: Arc<Shared>,
    next_link: AtomicU64,
    runtime: Handle,
    event_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NativeTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if there is no usable adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| {
            warn!("Bluetooth manager unavailable: {}", e);
            Error::TransportUnavailable
        })?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters.into_iter().next().ok_or_else(|| {
            warn!("No Bluetooth adapter found");
            Error::TransportUnavailable
        })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let events = adapter.events().await.map_err(Error::Bluetooth)?;
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            adapter,
            ready: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            peripherals: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            event_tx,
        });

        let runtime = Handle::current();
        let event_handle = runtime.spawn(Self::run_adapter_events(shared.clone(), events));

        Ok(Self {
            shared,
            next_link: AtomicU64::new(1),
            runtime,
            event_handle: Mutex::new(Some(event_handle)),
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.shared.adapter
    }

    /// Translate adapter events until the stream ends.
    async fn run_adapter_events(
        shared: Arc<Shared>,
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if shared.scanning.load(Ordering::SeqCst) {
                        Self::process_peripheral(&shared, id).await;
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    debug!("Device disconnected: {:?}", id);
                    Self::process_disconnect(&shared, &id);
                }
                CentralEvent::StateUpdate(state) => {
                    let ready = !matches!(state, CentralState::PoweredOff);
                    if shared.ready.swap(ready, Ordering::SeqCst) != ready {
                        info!("Bluetooth adapter state: {:?}", state);
                        if !ready {
                            shared.scanning.store(false, Ordering::SeqCst);
                        }
                        shared.emit(TransportEvent::AdapterStateChanged { ready });
                    }
                }
                _ => {}
            }
        }

        error!("Bluetooth adapter event stream ended");
        shared.emit(TransportEvent::TransportError {
            message: "adapter event stream ended".to_string(),
        });
    }

    /// Report a discovered peripheral.
    async fn process_peripheral(shared: &Shared, id: PeripheralId) {
        let peripheral = match shared.adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = id.to_string();
        shared
            .peripherals
            .write()
            .insert(address.clone(), peripheral);

        shared.emit(TransportEvent::DeviceDiscovered {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
            simulated: false,
        });
    }

    /// Report link drops for a peripheral.
    fn process_disconnect(shared: &Shared, id: &PeripheralId) {
        let dropped: Vec<LinkHandle> = shared
            .links
            .read()
            .iter()
            .filter(|(_, l)| l.peripheral.id() == *id)
            .map(|(link, _)| *link)
            .collect();

        for link in dropped {
            shared.emit(TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Disconnected,
                error: None,
            });
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn lookup(&self, address: &str) -> Result<Peripheral> {
        self.shared
            .peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })
    }
}

/// Map a btleplug failure to a link status.
pub(crate) fn link_error(e: &btleplug::Error) -> LinkError {
    let status = match e {
        btleplug::Error::TimedOut(_) => status::CONNECTION_TIMEOUT,
        btleplug::Error::DeviceNotFound => status::CONNECTION_FAILED_TO_ESTABLISH,
        btleplug::Error::NotConnected => status::REMOTE_USER_TERMINATED,
        _ => status::GATT_ERROR,
    };
    LinkError::new(status, e.to_string())
}

impl Transport for NativeTransport {
    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    fn start_scan(&self) {
        if self.shared.scanning.swap(true, Ordering::SeqCst) {
            debug!("Already scanning, ignoring start request");
            return;
        }

        info!("Starting BLE scan");
        let shared = self.shared.clone();
        self.spawn(async move {
            if let Err(e) = shared.adapter.start_scan(ScanFilter::default()).await {
                error!("Failed to start scan: {}", e);
                shared.scanning.store(false, Ordering::SeqCst);
                shared.emit(TransportEvent::ScanFailed {
                    code: SCAN_FAILED_INTERNAL_ERROR,
                });
            }
        });
    }

    fn stop_scan(&self) {
        if !self.shared.scanning.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return;
        }

        info!("Stopping BLE scan");
        let shared = self.shared.clone();
        self.spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn bond_state(&self, address: &str) -> Result<BondState> {
        self.lookup(address).map(|_| BondState::Bonded)
    }

    fn initiate_bond(&self, address: &str) {
        debug!("Pairing for {} is handled by the host", address);
        self.shared.emit(TransportEvent::BondStateChanged {
            address: address.to_string(),
            state: BondState::Bonded,
        });
    }

    fn open_link(&self, address: &str) -> Result<LinkHandle> {
        let peripheral = self.lookup(address)?;
        let link = LinkHandle::new(self.next_link.fetch_add(1, Ordering::SeqCst));

        self.shared.links.write().insert(
            link,
            OpenLink {
                peripheral: peripheral.clone(),
                battery_level: None,
            },
        );

        let shared = self.shared.clone();
        self.spawn(async move {
            let result = peripheral.connect().await;
            if !shared.is_open(link) {
                return;
            }
            let event = match result {
                Ok(()) => TransportEvent::LinkStateChanged {
                    link,
                    state: LinkState::Connected,
                    error: None,
                },
                Err(e) => {
                    warn!("Connection to {:?} failed: {}", peripheral.id(), e);
                    TransportEvent::LinkStateChanged {
                        link,
                        state: LinkState::Disconnected,
                        error: Some(link_error(&e)),
                    }
                }
            };
            shared.emit(event);
        });

        Ok(link)
    }

    fn discover_battery_service(&self, link: LinkHandle) {
        let Some(peripheral) = self.shared.link_peripheral(link) else {
            debug!("Service discovery on closed {}", link);
            return;
        };

        let shared = self.shared.clone();
        self.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Failed to discover services: {}", e);
                shared.emit(TransportEvent::OperationFailed {
                    link,
                    error: link_error(&e),
                });
                return;
            }

            let characteristic = peripheral.characteristics().into_iter().find(|c| {
                is_battery_level_characteristic(&c.uuid) && is_battery_service(&c.service_uuid)
            });
            let found = characteristic.is_some();

            match shared.links.write().get_mut(&link) {
                Some(open) => open.battery_level = characteristic,
                None => return,
            }

            shared.emit(TransportEvent::ServiceDiscovered { link, found });
        });
    }

    fn read_battery_level(&self, link: LinkHandle) {
        let target = self
            .shared
            .links
            .read()
            .get(&link)
            .map(|l| (l.peripheral.clone(), l.battery_level.clone()));

        let (peripheral, characteristic) = match target {
            Some((peripheral, Some(characteristic))) => (peripheral, characteristic),
            Some((_, None)) => {
                self.shared.emit(TransportEvent::OperationFailed {
                    link,
                    error: LinkError::new(status::GATT_ERROR, "battery level not discovered"),
                });
                return;
            }
            None => return,
        };

        let shared = self.shared.clone();
        self.spawn(async move {
            let event = match peripheral.read(&characteristic).await {
                Ok(data) => {
                    trace!("Read {} bytes from battery level", data.len());
                    TransportEvent::CharacteristicValue {
                        link,
                        bytes: Bytes::from(data),
                    }
                }
                Err(e) => TransportEvent::OperationFailed {
                    link,
                    error: link_error(&e),
                },
            };
            if shared.is_open(link) {
                shared.emit(event);
            }
        });
    }

    fn disconnect(&self, link: LinkHandle) {
        let Some(peripheral) = self.shared.link_peripheral(link) else {
            return;
        };

        let shared = self.shared.clone();
        self.spawn(async move {
            let error = match peripheral.disconnect().await {
                Ok(()) => None,
                Err(e) => {
                    error!("Failed to disconnect: {}", e);
                    Some(link_error(&e))
                }
            };
            if shared.is_open(link) {
                shared.emit(TransportEvent::LinkStateChanged {
                    link,
                    state: LinkState::Disconnected,
                    error,
                });
            }
        });
    }

    fn close_link(&self, link: LinkHandle) {
        let Some(open) = self.shared.links.write().remove(&link) else {
            return;
        };

        debug!("Closing {}", link);
        let peripheral = open.peripheral;
        self.spawn(async move {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to release {:?}: {}", peripheral.id(), e);
                }
            }
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.event_tx.subscribe()
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.get_mut().take() {
            handle.abort();
        }
    }
}
