//! Core application runner (business logic) for `tilt-listener`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with an injected scanner, publisher and
//! shutdown signal.
//!
//! The scan loop cycles through these states:
//!
//! ```text
//! INIT ──▶ SCANNING ──(window over)──▶ publish ──▶ SCANNING …
//!   │          │  ▲
//!   │   (transient error)
//!   │          ▼  │
//!   │        BACKOFF (1 s)
//!   ▼
//! fatal error            any state ──(shutdown)──▶ STOPPED
//! ```

use crate::calibration::Calibrator;
use crate::colour::DeviceColour;
use crate::decoder::decode_tilt_data;
use crate::message::{Aggregator, CycleMessage, Metrics};
use crate::output::{HISTORY_EXCHANGE, Publisher};
use crate::scanner::{Advertisement, Backend, ScanError, ScanEvent, ScanHandle};
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Pause after a failed or interrupted scan window.
pub const SCAN_BACKOFF: Duration = Duration::from_secs(1);

/// Window messages waiting for the publisher. Further windows are dropped.
pub const PUBLISH_QUEUE_SIZE: usize = 16;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Service instance name, used as the routing key of published messages.
    #[arg(long, default_value = "tilt")]
    pub name: String,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Length of one scan window. One message is published per window.
    /// Accepts duration with suffix: 5s, 500ms, 1m.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "5s", value_parser = crate::duration::parse_duration)]
    pub scan_window: Duration,

    /// Specific gravity calibration table (colour, uncalibrated, calibrated per line)
    #[arg(long, default_value = "SGCal.csv")]
    pub sg_calibration: PathBuf,

    /// Temperature calibration table in °F (colour, uncalibrated, calibrated per line)
    #[arg(long, default_value = "tempCal.csv")]
    pub temp_calibration: PathBuf,

    /// Verbose output, log every decoded reading
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Future returned by [`Scanner::open`].
pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn ScanHandle>, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    /// Open the radio for `backend`.
    fn open(&self, backend: Backend) -> OpenFuture<'_>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn open(&self, backend: Backend) -> OpenFuture<'_> {
        Box::pin(crate::scanner::open_scanner(backend))
    }
}

/// Decodes, enriches and aggregates advertisements window by window.
pub struct ScanLoop {
    window: Duration,
    sg_calibration: Calibrator,
    temp_calibration: Calibrator,
    aggregator: Aggregator,
}

impl ScanLoop {
    pub fn new(window: Duration, sg_calibration: Calibrator, temp_calibration: Calibrator) -> Self {
        Self {
            window,
            sg_calibration,
            temp_calibration,
            aggregator: Aggregator::new(),
        }
    }

    /// Feed one advertisement through decode → calibration → aggregation.
    ///
    /// Anything that is not a Tilt is ignored without logging.
    pub fn handle_advertisement(&mut self, advertisement: &Advertisement) {
        let Some(reading) = decode_tilt_data(&advertisement.payload, advertisement.rssi) else {
            return;
        };

        debug!(
            "colour: {}, temp: {}°F, sg: {}, signal strength: {} dBm",
            reading.colour, reading.raw_temp_f, reading.raw_sg, reading.rssi
        );

        let metrics = Metrics::from_reading(&reading, &self.sg_calibration, &self.temp_calibration);
        self.aggregator.upsert(reading.colour, metrics);
    }

    /// Close the current window and return its message.
    pub fn end_window(&mut self) -> CycleMessage {
        self.aggregator.flush()
    }

    /// Run scan windows until `shutdown` resolves or the adapter is lost.
    ///
    /// Each non-empty window message is handed to `publish_tx` without waiting;
    /// if the publisher is behind, the message is dropped. On shutdown the
    /// partially collected window is discarded. Transient errors back off and
    /// retry; a fatal [`ScanError`] ends the loop and is returned.
    pub async fn run<F>(
        &mut self,
        handle: &mut dyn ScanHandle,
        publish_tx: &mpsc::Sender<CycleMessage>,
        shutdown: F,
    ) -> Result<(), ScanError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        'scan: loop {
            let started = tokio::select! {
                _ = &mut shutdown => break 'scan,
                started = handle.start_scan(self.window) => started,
            };

            let mut events = match started {
                Ok(events) => events,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to start scan: {e}");
                    if back_off(&mut shutdown).await {
                        continue 'scan;
                    }
                    break 'scan;
                }
            };

            let interrupted = loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        self.aggregator.discard();
                        break 'scan;
                    }
                    event = events.recv() => match event {
                        Some(ScanEvent::Advertisement(advertisement)) => {
                            self.handle_advertisement(&advertisement);
                        }
                        Some(ScanEvent::Interrupted(e)) => break Some(e),
                        None => break None,
                    },
                }
            };

            self.publish_window(publish_tx);

            if let Some(e) = interrupted {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Encountered an error while scanning: {e}");
                if !back_off(&mut shutdown).await {
                    break 'scan;
                }
            }
        }

        debug!("Scan loop stopped");
        Ok(())
    }

    fn publish_window(&mut self, publish_tx: &mpsc::Sender<CycleMessage>) {
        if self.aggregator.is_empty() {
            return;
        }

        debug!("Scan window closed with {} Tilt(s)", self.aggregator.len());
        if let Err(e) = publish_tx.try_send(self.end_window()) {
            warn!("Dropping message for this scan window: {e}");
        }
    }
}

/// Sleep for [`SCAN_BACKOFF`]. Returns `false` if shutdown was requested meanwhile.
async fn back_off<F>(shutdown: &mut Pin<&mut F>) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => false,
        _ = tokio::time::sleep(SCAN_BACKOFF) => true,
    }
}

/// Run the service until `shutdown` resolves.
///
/// - Loads both calibration tables (missing files only produce warnings).
/// - Opens the radio; failure to do so, or losing the adapter later, is fatal
///   and returned.
/// - Runs the scan loop, publishing window messages from a separate task.
/// - On exit, stops the radio and waits for queued messages to be published.
pub async fn run<F>(
    options: Options,
    scanner: &dyn Scanner,
    mut publisher: Box<dyn Publisher>,
    shutdown: F,
) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let sg_calibration = Calibrator::load(&options.sg_calibration);
    let temp_calibration = Calibrator::load(&options.temp_calibration);
    log_uncalibrated("specific gravity", &sg_calibration);
    log_uncalibrated("temperature", &temp_calibration);

    let mut handle = scanner.open(options.backend).await?;

    info!(
        "Started Tilt scanner ({} backend, {:?} windows)",
        options.backend, options.scan_window
    );

    let (publish_tx, mut publish_rx) = mpsc::channel::<CycleMessage>(PUBLISH_QUEUE_SIZE);
    let routing_key = options.name;
    let publisher_task = tokio::spawn(async move {
        while let Some(message) = publish_rx.recv().await {
            if let Err(e) = publisher
                .publish(HISTORY_EXCHANGE, &routing_key, &message)
                .await
            {
                warn!("Failed to publish Tilt readings: {e}");
            }
        }
    });

    let mut scan_loop = ScanLoop::new(options.scan_window, sg_calibration, temp_calibration);
    let outcome = scan_loop.run(handle.as_mut(), &publish_tx, shutdown).await;

    handle.stop().await;
    drop(publish_tx);
    if let Err(e) = publisher_task.await {
        warn!("Publisher task ended abnormally: {e}");
    }

    outcome?;
    info!("Stopped Tilt scanner");
    Ok(())
}

fn log_uncalibrated(metric: &str, calibrator: &Calibrator) {
    if !DeviceColour::ALL
        .into_iter()
        .any(|colour| calibrator.is_calibrated(colour))
    {
        info!("No {metric} calibration curves loaded, publishing raw {metric} only");
    }
}
