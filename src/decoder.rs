//! Tilt advertisement decoding.
//!
//! A Tilt broadcasts an iBeacon. The manufacturer-specific field looks like this
//! (offsets in bytes):
//!
//! | offset | length | content                                     |
//! |--------|--------|---------------------------------------------|
//! | 0      | 2      | company ID, little-endian (Apple, `4C 00`)  |
//! | 2      | 2      | iBeacon type and length (`02 15`)           |
//! | 4      | 16     | identity value, encodes the device colour   |
//! | 20     | 2      | temperature in °F, big-endian               |
//! | 22     | 2      | specific gravity × 1000, big-endian         |
//! | 24     | 1      | calibrated TX power (unused)                |
//!
//! Backends hand over the whole manufacturer field in this form, so the decoder
//! never needs to know which radio stack produced it.

use crate::colour::{DeviceColour, IDENTITY_LEN};
use crate::reading::BeaconReading;

/// Offset of the identity value within the manufacturer field.
pub const IDENTITY_OFFSET: usize = 4;

const TEMPERATURE_OFFSET: usize = IDENTITY_OFFSET + IDENTITY_LEN;
const GRAVITY_OFFSET: usize = TEMPERATURE_OFFSET + 2;

/// Shortest manufacturer field that carries a full Tilt reading.
pub const MIN_PAYLOAD_LEN: usize = GRAVITY_OFFSET + 2;

/// Decode a Tilt manufacturer field into a reading.
///
/// Returns `None` when the payload is too short or its identity value is not
/// one of the eight Tilt colours. Most advertisements in range are not Tilts,
/// so `None` is an ordinary result and not an error.
pub fn decode_tilt_data(payload: &[u8], rssi: i16) -> Option<BeaconReading> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return None;
    }

    let colour = DeviceColour::from_identity(&payload[IDENTITY_OFFSET..TEMPERATURE_OFFSET])?;
    let raw_temp_f = u16::from_be_bytes([
        payload[TEMPERATURE_OFFSET],
        payload[TEMPERATURE_OFFSET + 1],
    ]);
    let gravity_points =
        u16::from_be_bytes([payload[GRAVITY_OFFSET], payload[GRAVITY_OFFSET + 1]]);

    Some(BeaconReading {
        colour,
        raw_temp_f,
        raw_sg: f64::from(gravity_points) / 1000.0,
        rssi,
    })
}

/// Decode a manufacturer field given as an ASCII-hex string.
///
/// Some BLE stacks expose manufacturer data as lowercase hex, e.g.
/// `"4c000215a495bb10c5b14b44b5121370f02d74de004603f8c5"`. Invalid hex decodes
/// to `None`, the same as any other malformed payload.
pub fn decode_hex(hex: &str, rssi: i16) -> Option<BeaconReading> {
    let bytes = hex_to_bytes(hex.trim())?;
    decode_tilt_data(&bytes, rssi)
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
