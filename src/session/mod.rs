//! Connection session.
//!
//! [`ConnectionSession`] owns the [`SessionMachine`], pumps transport events
//! into it, arms scan timeouts, and publishes a [`SessionSnapshot`] after
//! every change.

pub mod machine;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use machine::SessionMachine;

use crate::ble::connection::SessionState;
use crate::ble::transport::{Transport, TransportEvent};
use crate::config::SessionConfig;
use crate::data::{DiscoveredDevice, SessionSnapshot};
use crate::error::{Error, Result};

/// A single BLE session: scanning, plus at most one connection.
///
/// Every request returns immediately. Progress is observed through
/// [`ConnectionSession::snapshot`] or [`ConnectionSession::subscribe`].
pub struct ConnectionSession {
    /// The state machine, shared with the event pump and timeout tasks.
    machine: Arc<Mutex<SessionMachine>>,
    /// Snapshot channel.
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    /// Runtime the background tasks run on.
    runtime: Handle,
    /// Time after which a scan stops by itself.
    scan_timeout: Duration,
    /// Event pump task.
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    /// Pending scan timeout task.
    timeout_handle: Mutex<Option<JoinHandle<()>>>,
    /// Set by [`ConnectionSession::close`].
    is_closed: AtomicBool,
}

impl ConnectionSession {
    /// Create a session over a transport.
    ///
    /// Subscribes to the transport's events immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when called outside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no Tokio runtime: {}", e)))?;

        let events = transport.subscribe();
        let machine = Arc::new(Mutex::new(SessionMachine::new(
            transport,
            config.failure_classifier,
        )));
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let snapshot_tx = Arc::new(snapshot_tx);

        let pump_handle = runtime.spawn(Self::pump_events(
            events,
            machine.clone(),
            snapshot_tx.clone(),
        ));

        Ok(Self {
            machine,
            snapshot_tx,
            runtime,
            scan_timeout: config.scan_timeout,
            pump_handle: Mutex::new(Some(pump_handle)),
            timeout_handle: Mutex::new(None),
            is_closed: AtomicBool::new(false),
        })
    }

    /// Start scanning; the scan stops by itself after the configured timeout.
    ///
    /// Any active connection is torn down first and previous results are
    /// cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if the radio is off or BLE is
    /// unsupported, and [`Error::SessionClosed`] after [`Self::close`].
    pub fn start_scan(&self) -> Result<()> {
        self.ensure_open()?;

        let mut machine = self.machine.lock();
        let generation = machine.start_scan()?;
        publish(&self.snapshot_tx, &machine);

        // Armed under the machine lock so the newest generation owns the timer.
        self.arm_scan_timeout(generation);
        Ok(())
    }

    /// Stop scanning. Idempotent.
    pub fn stop_scan(&self) {
        self.cancel_scan_timeout();
        let mut machine = self.machine.lock();
        if machine.stop_scan() {
            publish(&self.snapshot_tx, &machine);
        }
    }

    /// Connect to a peripheral by address and read its battery level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if the radio is off or BLE is
    /// unsupported, and [`Error::SessionClosed`] after [`Self::close`].
    pub fn connect(&self, address: &str) -> Result<()> {
        self.ensure_open()?;
        self.cancel_scan_timeout();

        let mut machine = self.machine.lock();
        let result = machine.connect(address);
        publish(&self.snapshot_tx, &machine);
        result
    }

    /// Connect to a discovered device.
    ///
    /// # Errors
    ///
    /// See [`Self::connect`].
    pub fn connect_device(&self, device: &DiscoveredDevice) -> Result<()> {
        self.connect(&device.address)
    }

    /// Disconnect the current session, if any.
    pub fn disconnect(&self) {
        let mut machine = self.machine.lock();
        machine.disconnect();
        publish(&self.snapshot_tx, &machine);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current fine-grained state.
    pub fn state(&self) -> SessionState {
        self.machine.lock().state()
    }

    /// Check if scanning.
    pub fn is_scanning(&self) -> bool {
        self.machine.lock().is_scanning()
    }

    /// Stop scanning, tear down any connection, and stop processing events.
    pub fn close(&self) {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing connection session");
        self.cancel_scan_timeout();

        {
            let mut machine = self.machine.lock();
            machine.close();
            publish(&self.snapshot_tx, &machine);
        }

        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn arm_scan_timeout(&self, generation: u64) {
        let machine = self.machine.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let timeout = self.scan_timeout;

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut machine = machine.lock();
            if machine.scan_timed_out(generation) {
                publish(&snapshot_tx, &machine);
            }
        });

        if let Some(previous) = self.timeout_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_scan_timeout(&self) {
        if let Some(handle) = self.timeout_handle.lock().take() {
            handle.abort();
        }
    }

    /// Apply transport events until the transport goes away.
    async fn pump_events(
        mut events: broadcast::Receiver<TransportEvent>,
        machine: Arc<Mutex<SessionMachine>>,
        snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let mut machine = machine.lock();
                    machine.handle_event(event);
                    publish(&snapshot_tx, &machine);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Session lagged behind, dropped {} transport events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Transport event stream closed");
                    break;
                }
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Send the machine's snapshot if it differs from the last one.
///
/// Called with the machine locked so snapshots are published in the order
/// the transitions happened.
fn publish(snapshot_tx: &watch::Sender<SessionSnapshot>, machine: &SessionMachine) {
    let snapshot = machine.snapshot();
    snapshot_tx.send_if_modified(|current| {
        if *current == snapshot {
            false
        } else {
            *current = snapshot;
            true
        }
    });
}
