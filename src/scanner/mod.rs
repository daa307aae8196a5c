//! BLE scanner abstraction for Tilt hydrometers.
//!
//! A backend opens the radio once ([`open_scanner`]) and then runs bounded scan
//! windows on request. During a window it forwards the manufacturer-specific
//! field and signal strength of every iBeacon it hears through a channel; the
//! channel closes when the window ends. Decoding happens on the receiving side.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// The adapter cannot be opened at all. Nothing can be read without it.
    #[error("Bluetooth adapter unavailable: {0}")]
    Adapter(String),
    /// A driver or I/O error during scanning. Retrying later may succeed.
    #[error("Scan interrupted: {0}")]
    Transient(String),
}

impl ScanError {
    /// Whether the error means scanning can never succeed in this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Adapter(_))
    }
}

/// Apple's Bluetooth company identifier, used by all iBeacons.
#[cfg(any(feature = "bluer", feature = "hci"))]
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Start of every iBeacon manufacturer field: company ID (little-endian),
/// iBeacon type and payload length.
#[cfg(feature = "bluer")]
pub const IBEACON_PREFIX: [u8; 4] = [0x4C, 0x00, 0x02, 0x15];

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
#[cfg(any(feature = "bluer", feature = "hci"))]
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// Channel buffer size for scan events of one window.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// One raw advertisement heard during a scan window.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Complete manufacturer-specific field, starting with the company ID
    pub payload: Vec<u8>,
    /// Received signal strength in dBm
    pub rssi: i16,
}

/// Events delivered during a scan window.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    /// The window ended early because of an error. No more events follow.
    Interrupted(ScanError),
}

/// Future returned by [`ScanHandle::start_scan`].
pub type StartScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::Receiver<ScanEvent>, ScanError>> + Send + 'a>>;

/// An opened radio that can run scan windows.
pub trait ScanHandle: Send {
    /// Run one scan window of length `window` in the background.
    ///
    /// Events arrive on the returned receiver; it closes when the window is
    /// over. Dropping the receiver ends the window early.
    fn start_scan(&mut self, window: Duration) -> StartScanFuture<'_>;

    /// Stop scanning and release the radio.
    fn stop(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the radio for the given backend.
///
/// Failure here is fatal for the service: without an adapter no reading is
/// possible, so the caller should surface the error instead of retrying.
pub async fn open_scanner(backend: Backend) -> Result<Box<dyn ScanHandle>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerScanner::open().await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciScanner::open()?)),
    }
}
