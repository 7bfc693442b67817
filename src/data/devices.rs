//! Discovered peripherals and the de-duplicated scan result set.

use chrono::{DateTime, Utc};

/// Name shown for peripherals that never advertised one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// A BLE peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Advertised or cached name.
    pub name: Option<String>,
    /// Platform address; unique key of the device.
    pub address: String,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the device comes from a simulated transport.
    pub simulated: bool,
    /// When the device was last seen.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a device seen just now.
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            name,
            address: address.into(),
            rssi,
            simulated: false,
            last_seen: Utc::now(),
        }
    }

    /// Mark the device as simulated.
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    /// Name to display, falling back to [`UNKNOWN_DEVICE_NAME`].
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }

    fn sort_key(&self) -> std::cmp::Reverse<i16> {
        std::cmp::Reverse(self.rssi.unwrap_or(i16::MIN))
    }
}

/// Scan results keyed by address, strongest signal first.
///
/// Devices without a signal reading sort last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResults {
    devices: Vec<DiscoveredDevice>,
}

impl ScanResults {
    /// Create an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting.
    ///
    /// A known address is updated in place; a missing name or RSSI in the
    /// new sighting keeps the previous value. Returns `true` if the address
    /// was not known before.
    pub fn observe(&mut self, device: DiscoveredDevice) -> bool {
        let is_new = match self
            .devices
            .iter_mut()
            .find(|d| d.address == device.address)
        {
            Some(existing) => {
                if device.name.is_some() {
                    existing.name = device.name;
                }
                if device.rssi.is_some() {
                    existing.rssi = device.rssi;
                }
                existing.simulated = device.simulated;
                existing.last_seen = device.last_seen;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        };

        self.devices.sort_by_key(DiscoveredDevice::sort_key);
        is_new
    }

    /// Forget all devices.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Look up a device by address.
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// Whether the address has been seen.
    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Number of distinct devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been seen.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in display order.
    pub fn as_slice(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Iterate over devices in display order.
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter()
    }
}
