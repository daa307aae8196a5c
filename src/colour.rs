//! Tilt device colours and their broadcast identity values.
//!
//! Every Tilt hydrometer advertises a fixed 16-byte identity (an iBeacon UUID)
//! that encodes the colour of the physical unit. The colour is the only way to
//! tell several Tilts in the same room apart.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a Tilt identity value in bytes.
pub const IDENTITY_LEN: usize = 16;

/// The colour of a Tilt hydrometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceColour {
    Red,
    Green,
    Black,
    Purple,
    Orange,
    Blue,
    Yellow,
    Pink,
}

/// Identity values broadcast by each colour. Only the fourth byte differs.
const IDENTITIES: [(DeviceColour, [u8; IDENTITY_LEN]); 8] = [
    (DeviceColour::Red, identity(0x10)),
    (DeviceColour::Green, identity(0x20)),
    (DeviceColour::Black, identity(0x30)),
    (DeviceColour::Purple, identity(0x40)),
    (DeviceColour::Orange, identity(0x50)),
    (DeviceColour::Blue, identity(0x60)),
    (DeviceColour::Yellow, identity(0x70)),
    (DeviceColour::Pink, identity(0x80)),
];

const fn identity(colour_byte: u8) -> [u8; IDENTITY_LEN] {
    [
        0xA4, 0x95, 0xBB, colour_byte, 0xC5, 0xB1, 0x4B, 0x44, 0xB5, 0x12, 0x13, 0x70, 0xF0, 0x2D,
        0x74, 0xDE,
    ]
}

impl DeviceColour {
    /// All colours, in identity order.
    pub const ALL: [DeviceColour; 8] = [
        DeviceColour::Red,
        DeviceColour::Green,
        DeviceColour::Black,
        DeviceColour::Purple,
        DeviceColour::Orange,
        DeviceColour::Blue,
        DeviceColour::Yellow,
        DeviceColour::Pink,
    ];

    /// The identity value broadcast by a Tilt of this colour.
    pub fn identity(self) -> &'static [u8; IDENTITY_LEN] {
        // IDENTITIES is laid out in variant declaration order
        &IDENTITIES[self as usize].1
    }

    /// Look up the colour for a broadcast identity value.
    ///
    /// Returns `None` for anything that is not one of the eight known identities,
    /// which is the normal outcome for non-Tilt iBeacons.
    pub fn from_identity(bytes: &[u8]) -> Option<Self> {
        IDENTITIES
            .iter()
            .find(|(_, id)| id.as_slice() == bytes)
            .map(|(colour, _)| *colour)
    }

    /// Human-readable colour name, as used in published messages.
    pub fn name(self) -> &'static str {
        match self {
            DeviceColour::Red => "Red",
            DeviceColour::Green => "Green",
            DeviceColour::Black => "Black",
            DeviceColour::Purple => "Purple",
            DeviceColour::Orange => "Orange",
            DeviceColour::Blue => "Blue",
            DeviceColour::Yellow => "Yellow",
            DeviceColour::Pink => "Pink",
        }
    }
}

impl fmt::Display for DeviceColour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a colour name is not one of the eight Tilt colours.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown Tilt colour '{0}'")]
pub struct ParseColourError(pub String);

impl FromStr for DeviceColour {
    type Err = ParseColourError;

    /// Parse a colour name, ignoring case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        DeviceColour::ALL
            .into_iter()
            .find(|colour| colour.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| ParseColourError(name.to_string()))
    }
}

impl Serialize for DeviceColour {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}
