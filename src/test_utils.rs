use crate::colour::DeviceColour;

/// Build a complete Tilt manufacturer field (company ID, iBeacon prefix,
/// identity, temperature, gravity points and TX power).
pub fn tilt_payload(colour: DeviceColour, temp_f: u16, gravity_points: u16) -> Vec<u8> {
    let mut payload = vec![0x4C, 0x00, 0x02, 0x15];
    payload.extend_from_slice(colour.identity());
    payload.extend_from_slice(&temp_f.to_be_bytes());
    payload.extend_from_slice(&gravity_points.to_be_bytes());
    payload.push(0xC5);
    payload
}
