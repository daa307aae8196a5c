//! `tilt-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging set-up and
//! process exit codes. The scan loop lives in [`crate::app`] where it can be
//! tested deterministically with an injected scanner, publisher and shutdown signal.

pub mod app;
pub mod calibration;
pub mod colour;
pub mod convert;
pub mod decoder;
pub mod duration;
pub mod message;
pub mod output;
pub mod reading;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use calibration::Calibrator;
pub use colour::DeviceColour;
pub use decoder::{decode_hex, decode_tilt_data};
pub use message::{Aggregator, CycleMessage, Metrics};
pub use output::Publisher;
pub use output::json::JsonPublisher;
pub use reading::BeaconReading;
pub use scanner::{Advertisement, Backend, ScanError, ScanEvent, ScanHandle};
