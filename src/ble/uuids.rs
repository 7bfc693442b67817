//! BLE Service and Characteristic UUIDs.
//!
//! Contains the standard UUIDs used to read a peripheral's battery level.

use uuid::Uuid;

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID (`0x180F`).
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic UUID (`0x2A19`, Read, optionally Notify).
pub const BATTERY_LEVEL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is the Battery Service.
pub fn is_battery_service(uuid: &Uuid) -> bool {
    *uuid == BATTERY_SERVICE_UUID
}

/// Check if a characteristic UUID is the Battery Level characteristic.
pub fn is_battery_level_characteristic(uuid: &Uuid) -> bool {
    *uuid == BATTERY_LEVEL_CHARACTERISTIC_UUID
}
