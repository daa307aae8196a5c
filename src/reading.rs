//! Tilt beacon reading data structure.

use crate::colour::DeviceColour;

/// A single decoded Tilt advertisement.
///
/// Values are exactly what the hydrometer broadcast, before any calibration:
/// - Temperature in whole degrees Fahrenheit
/// - Specific gravity as a ratio (gravity points / 1000)
/// - Signal strength in dBm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeaconReading {
    /// Colour of the Tilt that sent the advertisement
    pub colour: DeviceColour,
    /// Temperature in degrees Fahrenheit
    pub raw_temp_f: u16,
    /// Specific gravity
    pub raw_sg: f64,
    /// Received signal strength in dBm
    pub rssi: i16,
}
