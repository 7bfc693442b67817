//! Utility functions for the ble-battery-session crate.

/// Highest valid Battery Level value, in percent.
pub const MAX_BATTERY_PERCENT: u8 = 100;

/// Decode a Battery Level characteristic value.
///
/// The value is a single unsigned byte holding a percentage. Extra bytes are
/// ignored; an empty value or a reserved value above 100 yields `None`.
///
/// # Example
///
/// ```
/// use ble_battery_session::parse_battery_level;
///
/// assert_eq!(parse_battery_level(&[55]), Some(55));
/// assert_eq!(parse_battery_level(&[]), None);
/// ```
#[inline]
pub fn parse_battery_level(value: &[u8]) -> Option<u8> {
    value
        .first()
        .copied()
        .filter(|percent| *percent <= MAX_BATTERY_PERCENT)
}
