//! The connection state machine.
//!
//! [`SessionMachine`] is synchronous: every request and every transport
//! event is applied under `&mut self`, and every transport call it makes
//! returns immediately. [`crate::ConnectionSession`] wraps it in a mutex
//! and feeds it from the transport's event stream.

use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::ble::connection::SessionState;
use crate::ble::transport::{
    BondState, LinkError, LinkHandle, LinkState, Transport, TransportEvent,
};
use crate::config::FailureClassifier;
use crate::data::{DiscoveredDevice, ScanResults, SessionSnapshot};
use crate::error::{Error, Result};
use crate::utils::parse_battery_level;

/// State machine for one connection at a time plus the scan result set.
pub struct SessionMachine {
    /// Transport all operations are issued to.
    transport: Arc<dyn Transport>,
    /// Classifies link failures into terminal states.
    classifier: FailureClassifier,
    /// Current state.
    state: SessionState,
    /// De-duplicated scan results.
    results: ScanResults,
    /// Whether a transport scan is running.
    scanning: bool,
    /// Incremented on every scan start.
    scan_generation: u64,
    /// Address of the peripheral being connected to.
    target: Option<String>,
    /// Link handle owned by the current session.
    link: Option<LinkHandle>,
    /// Address whose bond events the session is waiting for.
    bond_observer: Option<String>,
    /// Battery level from the last successful read.
    battery_level: Option<u8>,
    /// Set once the caller asked to disconnect.
    disconnect_requested: bool,
}

impl SessionMachine {
    /// Create an idle machine.
    pub fn new(transport: Arc<dyn Transport>, classifier: FailureClassifier) -> Self {
        Self {
            transport,
            classifier,
            state: SessionState::Idle,
            results: ScanResults::new(),
            scanning: false,
            scan_generation: 0,
            target: None,
            link: None,
            bond_observer: None,
            battery_level: None,
            disconnect_requested: false,
        }
    }

    /// Current fine-grained state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Generation of the current (or last) scan.
    pub fn scan_generation(&self) -> u64 {
        self.scan_generation
    }

    /// Scan results, strongest signal first.
    pub fn scan_results(&self) -> &ScanResults {
        &self.results
    }

    /// Address of the current connection target.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Link handle owned by the current session.
    pub fn link(&self) -> Option<LinkHandle> {
        self.link
    }

    /// Battery level, once read.
    pub fn battery_level(&self) -> Option<u8> {
        self.battery_level
    }

    /// Build the observer-facing snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            devices: self.results.as_slice().to_vec(),
            connection_state: self.state.connection_state(),
            battery_level: self.battery_level,
            is_scanning: self.scanning,
        }
    }

    /// Start a scan, clearing previous results.
    ///
    /// An active connection is torn down first. Returns the generation of
    /// the new scan, used to match its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if the transport is not ready;
    /// nothing changes in that case.
    pub fn start_scan(&mut self) -> Result<u64> {
        if !self.transport.is_ready() {
            warn!("Cannot scan: transport not ready");
            return Err(Error::TransportUnavailable);
        }

        if self.state.is_active() {
            info!("Leaving {} session to scan", self.state);
            self.release(SessionState::Disconnected);
        }

        self.results.clear();
        self.scan_generation += 1;

        if self.scanning {
            debug!("Scan already running, restarting results");
        } else {
            info!("Starting BLE scan");
            self.scanning = true;
            self.transport.start_scan();
        }

        self.set_state(SessionState::Scanning);
        Ok(self.scan_generation)
    }

    /// Stop the scan. Returns `false` if no scan was running.
    pub fn stop_scan(&mut self) -> bool {
        if !self.scanning {
            trace!("Not scanning, ignoring stop request");
            return false;
        }

        info!("Stopping BLE scan");
        self.scanning = false;
        self.transport.stop_scan();

        if self.state == SessionState::Scanning {
            self.set_state(SessionState::Idle);
        }
        true
    }

    /// Stop the scan of the given generation if it is still running.
    pub fn scan_timed_out(&mut self, generation: u64) -> bool {
        if !self.scanning || generation != self.scan_generation {
            trace!("Ignoring stale scan timeout (generation {})", generation);
            return false;
        }

        info!("Scan timed out after finding {} devices", self.results.len());
        self.stop_scan()
    }

    /// Start connecting to a peripheral.
    ///
    /// Stops any running scan, and abandons any previous connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] if the transport is not ready.
    /// Failures after that point are reported through the session state.
    pub fn connect(&mut self, address: &str) -> Result<()> {
        if !self.transport.is_ready() {
            warn!("Cannot connect to {}: transport not ready", address);
            return Err(Error::TransportUnavailable);
        }

        self.stop_scan();

        if self.state.is_active() || self.link.is_some() || self.bond_observer.is_some() {
            info!(
                "Abandoning {} session for {:?}",
                self.state,
                self.target.as_deref()
            );
            self.release(SessionState::Disconnected);
        }

        info!("Connecting to {}", address);
        self.target = Some(address.to_string());
        self.battery_level = None;
        self.disconnect_requested = false;
        self.set_state(SessionState::Connecting);

        match self.transport.bond_state(address) {
            Ok(BondState::Bonded) => {
                debug!("{} already bonded, opening link", address);
                self.open_link(address);
            }
            Ok(BondState::Unbonded) => {
                debug!("{} not bonded, initiating bonding", address);
                self.bond_observer = Some(address.to_string());
                self.set_state(SessionState::Bonding);
                self.transport.initiate_bond(address);
            }
            Ok(BondState::Bonding) => {
                debug!("{} already bonding, waiting for it", address);
                self.bond_observer = Some(address.to_string());
                self.set_state(SessionState::Bonding);
            }
            Err(e) => {
                warn!("Cannot query bond state of {}: {}", address, e);
                self.release(SessionState::Error);
            }
        }

        Ok(())
    }

    /// Request a disconnect.
    ///
    /// With an open link the session finalizes on the resulting link-down
    /// event; otherwise it ends immediately.
    pub fn disconnect(&mut self) {
        if !self.state.is_active() {
            trace!("Nothing to disconnect in state {}", self.state);
            return;
        }

        self.disconnect_requested = true;

        match self.link {
            Some(link) => {
                info!("Disconnecting {}", link);
                self.transport.disconnect(link);
            }
            None => {
                info!("Disconnect requested before link was opened");
                self.release(SessionState::Disconnected);
            }
        }
    }

    /// Stop scanning and tear down any session.
    pub fn close(&mut self) {
        self.stop_scan();
        if self.state.is_active() {
            self.release(SessionState::Disconnected);
        }
    }

    /// Apply a transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered {
                address,
                name,
                rssi,
                simulated,
            } => {
                if !self.scanning {
                    trace!("Ignoring discovery of {} outside a scan", address);
                    return;
                }
                let device = DiscoveredDevice::new(address, name, rssi).simulated(simulated);
                if self.results.observe(device) {
                    debug!("Discovered {} devices so far", self.results.len());
                }
            }
            TransportEvent::BondStateChanged { address, state } => {
                self.on_bond_state(&address, state);
            }
            TransportEvent::LinkStateChanged { link, state, error } => {
                if self.link != Some(link) {
                    trace!("Ignoring {:?} for stale {}", state, link);
                    return;
                }
                self.on_link_state(link, state, error);
            }
            TransportEvent::ServiceDiscovered { link, found } => {
                if self.link != Some(link) || self.state != SessionState::DiscoveringServices {
                    trace!("Ignoring service discovery for {}", link);
                    return;
                }
                if found {
                    debug!("Battery service found, reading level");
                    self.set_state(SessionState::ReadingCharacteristic);
                    self.transport.read_battery_level(link);
                } else {
                    warn!("Battery service not found, battery level unavailable");
                    self.battery_level = None;
                    self.set_state(SessionState::Connected);
                }
            }
            TransportEvent::CharacteristicValue { link, bytes } => {
                if self.link != Some(link)
                    || !matches!(
                        self.state,
                        SessionState::ReadingCharacteristic | SessionState::Connected
                    )
                {
                    trace!("Ignoring characteristic value for {}", link);
                    return;
                }
                self.battery_level = parse_battery_level(&bytes);
                match self.battery_level {
                    Some(level) => info!("Battery level received: {}%", level),
                    None => warn!("Invalid battery level value: {:02x?}", bytes.as_ref()),
                }
                self.set_state(SessionState::Connected);
            }
            TransportEvent::OperationFailed { link, error } => {
                if self.link != Some(link) {
                    trace!("Ignoring failure on stale {}", link);
                    return;
                }
                warn!("Operation on {} failed in {}: {}", link, self.state, error);
                let outcome = self.failure_outcome(Some(&error));
                self.release(outcome);
            }
            TransportEvent::ScanCompleted => {
                if !self.scanning {
                    return;
                }
                info!("Scan completed with {} devices", self.results.len());
                self.scanning = false;
                if self.state == SessionState::Scanning {
                    self.set_state(SessionState::Idle);
                }
            }
            TransportEvent::ScanFailed { code } => {
                if !self.scanning {
                    return;
                }
                warn!("BLE scan failed with error code: {}", code);
                self.scanning = false;
                if self.state == SessionState::Scanning {
                    self.set_state(SessionState::Idle);
                }
            }
            TransportEvent::AdapterStateChanged { ready } => {
                if ready {
                    info!("Bluetooth adapter ready");
                    return;
                }
                warn!("Bluetooth adapter no longer ready");
                if self.scanning {
                    self.scanning = false;
                    if self.state == SessionState::Scanning {
                        self.set_state(SessionState::Idle);
                    }
                }
                if self.state.is_active() {
                    self.release(SessionState::Disconnected);
                }
            }
            TransportEvent::TransportError { message } => {
                error!("Unrecoverable transport error: {}", message);
                self.scanning = false;
                self.release(SessionState::Error);
            }
        }
    }

    /// Terminal cleanup.
    ///
    /// Cancels the bond observer, closes the link, clears the battery level
    /// and the target, then moves to `outcome`. Safe to call repeatedly:
    /// later calls find nothing left to release.
    pub fn release(&mut self, outcome: SessionState) {
        if let Some(address) = self.bond_observer.take() {
            debug!("Stopped observing bond state of {}", address);
        }
        if let Some(link) = self.link.take() {
            debug!("Closing {}", link);
            self.transport.close_link(link);
        }
        self.battery_level = None;
        self.target = None;
        self.disconnect_requested = false;
        self.set_state(outcome);
    }

    fn on_bond_state(&mut self, address: &str, state: BondState) {
        if self.bond_observer.as_deref() != Some(address) {
            trace!("Ignoring bond state {} for {}", state, address);
            return;
        }

        match state {
            BondState::Bonded => {
                info!("Bonding successful with {}, opening link", address);
                self.bond_observer = None;
                self.open_link(address);
            }
            BondState::Bonding => {
                debug!("Bonding in progress with {}", address);
            }
            BondState::Unbonded => {
                warn!("Bonding failed or was cancelled for {}", address);
                self.release(SessionState::Disconnected);
            }
        }
    }

    fn on_link_state(&mut self, link: LinkHandle, state: LinkState, error: Option<LinkError>) {
        match state {
            LinkState::Connected => {
                if self.state != SessionState::LinkEstablishing {
                    trace!("Ignoring link up for {} in {}", link, self.state);
                    return;
                }
                info!("{} established, discovering services", link);
                self.set_state(SessionState::DiscoveringServices);
                self.transport.discover_battery_service(link);
            }
            LinkState::Disconnected => {
                let outcome = if self.state == SessionState::Connected {
                    SessionState::Disconnected
                } else {
                    self.failure_outcome(error.as_ref())
                };
                match &error {
                    Some(e) => warn!("{} lost in {}: {}", link, self.state, e),
                    None => info!("{} closed in {}", link, self.state),
                }
                self.release(outcome);
            }
        }
    }

    fn open_link(&mut self, address: &str) {
        match self.transport.open_link(address) {
            Ok(link) => {
                debug!("Opening {} to {}", link, address);
                self.link = Some(link);
                self.set_state(SessionState::LinkEstablishing);
            }
            Err(e) => {
                warn!("Cannot open link to {}: {}", address, e);
                self.release(SessionState::Error);
            }
        }
    }

    fn failure_outcome(&self, error: Option<&LinkError>) -> SessionState {
        if self.disconnect_requested {
            return SessionState::Disconnected;
        }
        self.classifier.classify(error).session_state()
    }

    fn set_state(&mut self, new_state: SessionState) {
        if self.state != new_state {
            debug!("Session state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ConnectionState;
    use crate::ble::transport::{status, MockTransport};
    use bytes::Bytes;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const D: &str = "AA:BB:CC:DD:EE:01";
    const LINK: LinkHandle = LinkHandle::new(1);

    fn ready_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect_is_ready().return_const(true);
        mock
    }

    fn machine(mock: MockTransport) -> SessionMachine {
        SessionMachine::new(Arc::new(mock), FailureClassifier::default())
    }

    fn discovered(address: &str, rssi: i16) -> TransportEvent {
        TransportEvent::DeviceDiscovered {
            address: address.to_string(),
            name: None,
            rssi: Some(rssi),
            simulated: false,
        }
    }

    fn link_up() -> TransportEvent {
        TransportEvent::LinkStateChanged {
            link: LINK,
            state: LinkState::Connected,
            error: None,
        }
    }

    fn link_down(error: Option<LinkError>) -> TransportEvent {
        TransportEvent::LinkStateChanged {
            link: LINK,
            state: LinkState::Disconnected,
            error,
        }
    }

    fn bond(state: BondState) -> TransportEvent {
        TransportEvent::BondStateChanged {
            address: D.to_string(),
            state,
        }
    }

    /// A mock whose peripheral is bonded and whose link opens as [`LINK`].
    fn bonded_mock() -> MockTransport {
        let mut mock = ready_mock();
        mock.expect_bond_state()
            .with(eq(D))
            .returning(|_| Ok(BondState::Bonded));
        mock.expect_open_link()
            .with(eq(D))
            .times(1)
            .returning(|_| Ok(LINK));
        mock
    }

    #[test]
    fn test_successful_connect_with_battery() {
        let mut mock = bonded_mock();
        mock.expect_discover_battery_service()
            .with(eq(LINK))
            .times(1)
            .return_const(());
        mock.expect_read_battery_level()
            .with(eq(LINK))
            .times(1)
            .return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        assert_eq!(m.state(), SessionState::LinkEstablishing);
        m.handle_event(link_up());
        assert_eq!(m.state(), SessionState::DiscoveringServices);
        m.handle_event(TransportEvent::ServiceDiscovered {
            link: LINK,
            found: true,
        });
        assert_eq!(m.state(), SessionState::ReadingCharacteristic);
        assert_eq!(
            m.snapshot().connection_state,
            ConnectionState::Connecting
        );
        m.handle_event(TransportEvent::CharacteristicValue {
            link: LINK,
            bytes: Bytes::from_static(&[55]),
        });

        let snapshot = m.snapshot();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.battery_level, Some(55));
        assert_eq!(m.target(), Some(D));
    }

    #[test]
    fn test_bonding_failure() {
        let mut mock = ready_mock();
        mock.expect_bond_state()
            .returning(|_| Ok(BondState::Unbonded));
        mock.expect_initiate_bond()
            .with(eq(D))
            .times(1)
            .return_const(());
        mock.expect_open_link().times(0);
        let mut m = machine(mock);

        m.connect(D).unwrap();
        assert_eq!(m.state(), SessionState::Bonding);
        m.handle_event(bond(BondState::Bonding));
        assert_eq!(m.state(), SessionState::Bonding);
        m.handle_event(bond(BondState::Unbonded));

        assert_eq!(m.state(), SessionState::Disconnected);
        assert_eq!(m.battery_level(), None);
        assert_eq!(m.target(), None);
    }

    #[test]
    fn test_no_battery_service() {
        let mut mock = bonded_mock();
        mock.expect_discover_battery_service().return_const(());
        mock.expect_read_battery_level().times(0);
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(link_up());
        m.handle_event(TransportEvent::ServiceDiscovered {
            link: LINK,
            found: false,
        });

        let snapshot = m.snapshot();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.battery_level, None);
    }

    #[test]
    fn test_bond_before_link() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();

        let mut mock = ready_mock();
        mock.expect_bond_state()
            .returning(|_| Ok(BondState::Unbonded));
        mock.expect_initiate_bond().times(1).return_const(());
        mock.expect_open_link().times(1).returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(LINK)
        });
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(bond(BondState::Bonding));
        // Bond events for other peripherals do not count.
        m.handle_event(TransportEvent::BondStateChanged {
            address: "other".to_string(),
            state: BondState::Bonded,
        });
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(m.link(), None);

        m.handle_event(bond(BondState::Bonded));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(m.state(), SessionState::LinkEstablishing);
        assert_eq!(m.link(), Some(LINK));
    }

    #[test]
    fn test_existing_bonding_is_not_restarted() {
        let mut mock = ready_mock();
        mock.expect_bond_state()
            .returning(|_| Ok(BondState::Bonding));
        mock.expect_initiate_bond().times(0);
        mock.expect_open_link().times(1).returning(|_| Ok(LINK));
        let mut m = machine(mock);

        m.connect(D).unwrap();
        assert_eq!(m.state(), SessionState::Bonding);
        m.handle_event(bond(BondState::Bonded));
        assert_eq!(m.state(), SessionState::LinkEstablishing);
    }

    #[test]
    fn test_connect_stops_scan() {
        let mut mock = bonded_mock();
        mock.expect_start_scan().times(1).return_const(());
        mock.expect_stop_scan().times(1).return_const(());
        let mut m = machine(mock);

        m.start_scan().unwrap();
        m.handle_event(discovered("A", -40));
        m.handle_event(discovered(D, -60));
        assert_eq!(m.scan_results().len(), 2);

        m.connect(D).unwrap();
        assert!(!m.is_scanning());

        m.handle_event(discovered("B", -30));
        m.handle_event(discovered("A", -20));
        assert_eq!(m.scan_results().len(), 2);
        assert_eq!(m.scan_results().get("A").unwrap().rssi, Some(-40));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut mock = bonded_mock();
        mock.expect_close_link()
            .with(eq(LINK))
            .times(1)
            .return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.release(SessionState::Disconnected);
        let first = m.snapshot();
        m.release(SessionState::Disconnected);

        assert_eq!(m.snapshot(), first);
        assert_eq!(m.state(), SessionState::Disconnected);
        assert_eq!(m.link(), None);
        assert_eq!(m.target(), None);
    }

    #[test]
    fn test_disconnect_finalizes_on_link_drop() {
        let mut mock = bonded_mock();
        mock.expect_discover_battery_service().return_const(());
        mock.expect_disconnect()
            .with(eq(LINK))
            .times(1)
            .return_const(());
        mock.expect_close_link().times(1).return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(link_up());
        m.handle_event(TransportEvent::ServiceDiscovered {
            link: LINK,
            found: false,
        });

        m.disconnect();
        assert_eq!(m.state(), SessionState::Connected);

        m.handle_event(link_down(None));
        assert_eq!(m.state(), SessionState::Disconnected);

        // A second link-down for the same handle changes nothing.
        m.handle_event(link_down(None));
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_disconnect_requested_failure_is_not_error() {
        let mut mock = bonded_mock();
        mock.expect_disconnect().return_const(());
        mock.expect_close_link().return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.disconnect();
        m.handle_event(link_down(Some(LinkError::new(status::GATT_ERROR, "aborted"))));
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_disconnect_while_bonding() {
        let mut mock = ready_mock();
        mock.expect_bond_state()
            .returning(|_| Ok(BondState::Unbonded));
        mock.expect_initiate_bond().return_const(());
        mock.expect_open_link().times(0);
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.disconnect();
        assert_eq!(m.state(), SessionState::Disconnected);

        // The bond finishing later must not resurrect the session.
        m.handle_event(bond(BondState::Bonded));
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_link_failure_classification() {
        let mut mock = bonded_mock();
        mock.expect_close_link().return_const(());
        let mut m = machine(mock);
        m.connect(D).unwrap();
        m.handle_event(link_down(Some(LinkError::new(status::GATT_ERROR, "gatt"))));
        assert_eq!(m.state(), SessionState::Error);

        let mut mock = bonded_mock();
        mock.expect_close_link().return_const(());
        let mut m = machine(mock);
        m.connect(D).unwrap();
        m.handle_event(link_down(Some(LinkError::new(
            status::CONNECTION_TIMEOUT,
            "timeout",
        ))));
        assert_eq!(m.state(), SessionState::Disconnected);

        let mut mock = bonded_mock();
        mock.expect_close_link().return_const(());
        let mut m = machine(mock);
        m.connect(D).unwrap();
        m.handle_event(link_down(None));
        assert_eq!(m.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_connected_link_drop_is_disconnected() {
        let mut mock = bonded_mock();
        mock.expect_discover_battery_service().return_const(());
        mock.expect_read_battery_level().return_const(());
        mock.expect_close_link().times(1).return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(link_up());
        m.handle_event(TransportEvent::ServiceDiscovered {
            link: LINK,
            found: true,
        });
        m.handle_event(TransportEvent::CharacteristicValue {
            link: LINK,
            bytes: Bytes::from_static(&[80]),
        });
        assert_eq!(m.battery_level(), Some(80));

        m.handle_event(link_down(Some(LinkError::new(status::GATT_ERROR, "gone"))));
        assert_eq!(m.state(), SessionState::Disconnected);
        assert_eq!(m.battery_level(), None);
    }

    #[test]
    fn test_read_failure_is_link_failure() {
        let mut mock = bonded_mock();
        mock.expect_discover_battery_service().return_const(());
        mock.expect_read_battery_level().return_const(());
        mock.expect_close_link().times(1).return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(link_up());
        m.handle_event(TransportEvent::ServiceDiscovered {
            link: LINK,
            found: true,
        });
        m.handle_event(TransportEvent::OperationFailed {
            link: LINK,
            error: LinkError::new(status::GATT_ERROR, "read failed"),
        });
        assert_eq!(m.state(), SessionState::Error);
    }

    #[test]
    fn test_device_not_found() {
        let mut mock = ready_mock();
        mock.expect_bond_state().returning(|address| {
            Err(Error::DeviceNotFound {
                address: address.to_string(),
            })
        });
        let mut m = machine(mock);

        m.connect(D).unwrap();
        assert_eq!(m.state(), SessionState::Error);
        assert_eq!(m.target(), None);
    }

    #[test]
    fn test_transport_unavailable() {
        let mut mock = MockTransport::new();
        mock.expect_is_ready().return_const(false);
        mock.expect_start_scan().times(0);
        mock.expect_bond_state().times(0);
        let mut m = machine(mock);

        assert!(matches!(m.start_scan(), Err(Error::TransportUnavailable)));
        assert!(matches!(m.connect(D), Err(Error::TransportUnavailable)));
        assert_eq!(m.state(), SessionState::Idle);
        assert!(!m.is_scanning());
    }

    #[test]
    fn test_new_connect_abandons_previous() {
        let mut mock = ready_mock();
        mock.expect_bond_state()
            .returning(|_| Ok(BondState::Bonded));
        let mut next = 0;
        mock.expect_open_link().times(2).returning(move |_| {
            next += 1;
            Ok(LinkHandle::new(next))
        });
        mock.expect_close_link()
            .with(eq(LinkHandle::new(1)))
            .times(1)
            .return_const(());
        mock.expect_discover_battery_service()
            .with(eq(LinkHandle::new(2)))
            .times(1)
            .return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.connect("AA:BB:CC:DD:EE:02").unwrap();
        assert_eq!(m.link(), Some(LinkHandle::new(2)));
        assert_eq!(m.target(), Some("AA:BB:CC:DD:EE:02"));

        // Events for the abandoned link are ignored.
        m.handle_event(TransportEvent::LinkStateChanged {
            link: LinkHandle::new(1),
            state: LinkState::Connected,
            error: None,
        });
        assert_eq!(m.state(), SessionState::LinkEstablishing);

        m.handle_event(TransportEvent::LinkStateChanged {
            link: LinkHandle::new(2),
            state: LinkState::Connected,
            error: None,
        });
        assert_eq!(m.state(), SessionState::DiscoveringServices);
    }

    #[test]
    fn test_scan_timeout_generation() {
        let mut mock = ready_mock();
        mock.expect_start_scan().times(1).return_const(());
        mock.expect_stop_scan().times(1).return_const(());
        let mut m = machine(mock);

        let first = m.start_scan().unwrap();
        let second = m.start_scan().unwrap();
        assert_ne!(first, second);

        m.handle_event(discovered("A", -50));
        assert!(!m.scan_timed_out(first));
        assert!(m.is_scanning());

        assert!(m.scan_timed_out(second));
        assert!(!m.is_scanning());
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.scan_results().len(), 1);

        assert!(!m.stop_scan());
    }

    #[test]
    fn test_scan_failed() {
        let mut mock = ready_mock();
        mock.expect_start_scan().return_const(());
        mock.expect_stop_scan().times(0);
        let mut m = machine(mock);

        m.start_scan().unwrap();
        m.handle_event(TransportEvent::ScanFailed { code: 2 });
        assert!(!m.is_scanning());
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn test_scan_completed_by_transport() {
        let mut mock = ready_mock();
        mock.expect_start_scan().times(1).return_const(());
        mock.expect_stop_scan().times(0);
        let mut m = machine(mock);

        let generation = m.start_scan().unwrap();
        m.handle_event(discovered("A", -50));
        m.handle_event(TransportEvent::ScanCompleted);

        assert!(!m.is_scanning());
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(m.scan_results().len(), 1);
        assert!(!m.scan_timed_out(generation));

        // Sightings after the scan ended are ignored.
        m.handle_event(discovered("B", -40));
        assert_eq!(m.scan_results().len(), 1);
    }

    #[test]
    fn test_transport_error() {
        let mut mock = bonded_mock();
        mock.expect_close_link().times(1).return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.handle_event(TransportEvent::TransportError {
            message: "adapter removed".to_string(),
        });
        assert_eq!(m.state(), SessionState::Error);
        assert_eq!(m.snapshot().connection_state, ConnectionState::Error);
    }

    #[test]
    fn test_scan_leaves_active_session() {
        let mut mock = bonded_mock();
        mock.expect_close_link().times(1).return_const(());
        mock.expect_start_scan().times(1).return_const(());
        let mut m = machine(mock);

        m.connect(D).unwrap();
        m.start_scan().unwrap();
        assert_eq!(m.state(), SessionState::Scanning);
        assert_eq!(m.link(), None);
        assert!(m.is_scanning());
    }
}
