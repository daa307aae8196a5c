//! Per-window aggregation of Tilt readings into publishable messages.
//!
//! Each scan window produces at most one metrics record per colour. A Tilt
//! broadcasts every few seconds, so several readings of the same colour can
//! arrive within a window; the last one wins.

use crate::calibration::Calibrator;
use crate::colour::DeviceColour;
use crate::convert::{round_to, to_celsius, to_plato};
use crate::reading::BeaconReading;
use log::info;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Decimal places for published temperatures (°C and calibrated °F).
pub const TEMPERATURE_DIGITS: u32 = 2;

/// Decimal places for calibrated specific gravity.
pub const GRAVITY_DIGITS: u32 = 3;

/// Metrics published for one colour.
///
/// Calibrated values are only present when a calibration curve exists for the
/// colour and are left out of the serialised message otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    #[serde(rename = "Temperature[degF]")]
    pub temperature_f: u16,
    #[serde(rename = "Temperature[degC]")]
    pub temperature_c: f64,
    #[serde(rename = "Specific gravity")]
    pub specific_gravity: f64,
    #[serde(rename = "Signal strength[dBm]")]
    pub rssi: i16,
    #[serde(rename = "Plato[degP]")]
    pub plato: f64,
    #[serde(
        rename = "Calibrated temperature[degF]",
        skip_serializing_if = "Option::is_none"
    )]
    pub calibrated_temperature_f: Option<f64>,
    #[serde(
        rename = "Calibrated temperature[degC]",
        skip_serializing_if = "Option::is_none"
    )]
    pub calibrated_temperature_c: Option<f64>,
    #[serde(
        rename = "Calibrated specific gravity",
        skip_serializing_if = "Option::is_none"
    )]
    pub calibrated_specific_gravity: Option<f64>,
    #[serde(rename = "Calibrated plato[degP]", skip_serializing_if = "Option::is_none")]
    pub calibrated_plato: Option<f64>,
}

impl Metrics {
    /// Enrich a decoded reading with unit conversions and calibrated values.
    ///
    /// Raw conversions only ever use the decoded values. Calibrated °C and °P are
    /// derived from the unrounded calibrated °F and specific gravity, so every
    /// published value is rounded exactly once.
    pub fn from_reading(
        reading: &BeaconReading,
        sg_calibration: &Calibrator,
        temp_calibration: &Calibrator,
    ) -> Self {
        let temp_f = f64::from(reading.raw_temp_f);
        let calibrated_f = temp_calibration.evaluate(reading.colour, temp_f);
        let calibrated_sg = sg_calibration.evaluate(reading.colour, reading.raw_sg);

        Metrics {
            temperature_f: reading.raw_temp_f,
            temperature_c: round_to(to_celsius(temp_f), TEMPERATURE_DIGITS),
            specific_gravity: reading.raw_sg,
            rssi: reading.rssi,
            plato: to_plato(reading.raw_sg),
            calibrated_temperature_f: calibrated_f.map(|f| round_to(f, TEMPERATURE_DIGITS)),
            calibrated_temperature_c: calibrated_f
                .map(|f| round_to(to_celsius(f), TEMPERATURE_DIGITS)),
            calibrated_specific_gravity: calibrated_sg.map(|sg| round_to(sg, GRAVITY_DIGITS)),
            calibrated_plato: calibrated_sg.map(to_plato),
        }
    }
}

/// The message for one scan window: colour → metrics.
pub type CycleMessage = BTreeMap<DeviceColour, Metrics>;

/// Collects metrics for the current scan window.
///
/// Also remembers every colour seen since start-up, purely to log the first
/// sighting of each Tilt. That set is never published or cleared.
#[derive(Debug, Default)]
pub struct Aggregator {
    current: CycleMessage,
    seen: HashSet<DeviceColour>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `metrics` for `colour`, replacing anything stored earlier in this window.
    pub fn upsert(&mut self, colour: DeviceColour, metrics: Metrics) {
        if self.seen.insert(colour) {
            info!("Found {colour} Tilt");
        }
        self.current.insert(colour, metrics);
    }

    /// Take the current window's message and start an empty one.
    pub fn flush(&mut self) -> CycleMessage {
        std::mem::take(&mut self.current)
    }

    /// Drop the current window's message without returning it.
    pub fn discard(&mut self) {
        self.current.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    #[cfg(test)]
    fn seen(&self, colour: DeviceColour) -> bool {
        self.seen.contains(&colour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTable;
    use serde_json::json;

    fn reading(colour: DeviceColour, raw_temp_f: u16, raw_sg: f64, rssi: i16) -> BeaconReading {
        BeaconReading {
            colour,
            raw_temp_f,
            raw_sg,
            rssi,
        }
    }

    fn metrics(colour: DeviceColour, raw_temp_f: u16, raw_sg: f64, rssi: i16) -> Metrics {
        Metrics::from_reading(
            &reading(colour, raw_temp_f, raw_sg, rssi),
            &Calibrator::uncalibrated(),
            &Calibrator::uncalibrated(),
        )
    }

    fn offset_calibrator(colour: DeviceColour, xs: [f64; 4], offset: f64) -> Calibrator {
        let mut table = CalibrationTable::new();
        table.insert(colour, xs.iter().map(|&x| (x, x + offset)).collect());
        Calibrator::from_table(&table, "test")
    }

    #[test]
    fn test_metrics_uncalibrated() {
        let m = metrics(DeviceColour::Red, 70, 1.05, -60);
        assert_eq!(m.temperature_f, 70);
        assert_eq!(m.temperature_c, 21.11);
        assert_eq!(m.specific_gravity, 1.05);
        assert_eq!(m.rssi, -60);
        assert_eq!(m.plato, to_plato(1.05));
        assert_eq!(m.calibrated_temperature_f, None);
        assert_eq!(m.calibrated_temperature_c, None);
        assert_eq!(m.calibrated_specific_gravity, None);
        assert_eq!(m.calibrated_plato, None);
    }

    #[test]
    fn test_metrics_calibrated() {
        let sg = offset_calibrator(DeviceColour::Red, [1.0, 1.02, 1.04, 1.06], 0.002);
        let temp = offset_calibrator(DeviceColour::Red, [50.0, 60.0, 70.0, 80.0], 2.0);

        let m = Metrics::from_reading(&reading(DeviceColour::Red, 68, 1.05, -60), &sg, &temp);
        assert_eq!(m.temperature_f, 68);
        assert_eq!(m.specific_gravity, 1.05);
        assert_eq!(m.calibrated_temperature_f, Some(70.0));
        assert_eq!(m.calibrated_temperature_c, Some(21.11));
        assert_eq!(m.calibrated_specific_gravity, Some(1.052));
        assert!((m.calibrated_plato.unwrap() - to_plato(1.052)).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_calibrated_celsius_rounded_once() {
        // 68 °F calibrates to 70.0051 °F: published as 70.01, which alone would give
        // 21.12 °C, while the unrounded value gives 21.114 °C.
        let temp = offset_calibrator(DeviceColour::Red, [50.0, 60.0, 70.0, 80.0], 2.0051);

        let m = Metrics::from_reading(
            &reading(DeviceColour::Red, 68, 1.05, -60),
            &Calibrator::uncalibrated(),
            &temp,
        );
        assert_eq!(m.calibrated_temperature_f, Some(70.01));
        assert_eq!(m.calibrated_temperature_c, Some(21.11));
    }

    #[test]
    fn test_metrics_calibration_is_per_colour() {
        let sg = offset_calibrator(DeviceColour::Red, [1.0, 1.02, 1.04, 1.06], 0.002);

        let m = Metrics::from_reading(
            &reading(DeviceColour::Blue, 68, 1.05, -60),
            &sg,
            &Calibrator::uncalibrated(),
        );
        assert_eq!(m.calibrated_specific_gravity, None);
    }

    #[test]
    fn test_metrics_serialization_keys() {
        let value = serde_json::to_value(metrics(DeviceColour::Red, 70, 1.05, -60)).unwrap();
        assert_eq!(
            value,
            json!({
                "Temperature[degF]": 70,
                "Temperature[degC]": 21.11,
                "Specific gravity": 1.05,
                "Signal strength[dBm]": -60,
                "Plato[degP]": to_plato(1.05),
            })
        );
    }

    #[test]
    fn test_metrics_serialization_calibrated_keys() {
        let sg = offset_calibrator(DeviceColour::Red, [1.0, 1.02, 1.04, 1.06], 0.002);
        let temp = offset_calibrator(DeviceColour::Red, [50.0, 60.0, 70.0, 80.0], 2.0);
        let m = Metrics::from_reading(&reading(DeviceColour::Red, 68, 1.05, -60), &sg, &temp);

        let value = serde_json::to_value(m).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 9);
        assert_eq!(object["Calibrated temperature[degF]"], json!(70.0));
        assert_eq!(object["Calibrated temperature[degC]"], json!(21.11));
        assert_eq!(object["Calibrated specific gravity"], json!(1.052));
        assert!(object.contains_key("Calibrated plato[degP]"));
    }

    #[test]
    fn test_aggregator_last_value_wins() {
        let mut aggregator = Aggregator::new();
        aggregator.upsert(DeviceColour::Red, metrics(DeviceColour::Red, 70, 1.05, -60));
        aggregator.upsert(DeviceColour::Red, metrics(DeviceColour::Red, 71, 1.049, -58));
        assert_eq!(aggregator.len(), 1);

        let message = aggregator.flush();
        assert_eq!(message.len(), 1);
        let red = &message[&DeviceColour::Red];
        assert_eq!(red.temperature_f, 71);
        assert_eq!(red.specific_gravity, 1.049);
        assert_eq!(red.rssi, -58);

        assert!(aggregator.flush().is_empty());
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_aggregator_multiple_colours() {
        let mut aggregator = Aggregator::new();
        aggregator.upsert(DeviceColour::Pink, metrics(DeviceColour::Pink, 64, 1.01, -80));
        aggregator.upsert(DeviceColour::Black, metrics(DeviceColour::Black, 66, 1.02, -70));

        let message = aggregator.flush();
        let colours: Vec<_> = message.keys().copied().collect();
        assert_eq!(colours, vec![DeviceColour::Black, DeviceColour::Pink]);
    }

    #[test]
    fn test_aggregator_flush_empty() {
        let mut aggregator = Aggregator::new();
        assert!(aggregator.flush().is_empty());
    }

    #[test]
    fn test_aggregator_seen_survives_flush_and_discard() {
        let mut aggregator = Aggregator::new();
        assert!(!aggregator.seen(DeviceColour::Green));

        aggregator.upsert(DeviceColour::Green, metrics(DeviceColour::Green, 70, 1.05, -60));
        aggregator.flush();
        assert!(aggregator.seen(DeviceColour::Green));

        aggregator.upsert(DeviceColour::Green, metrics(DeviceColour::Green, 70, 1.05, -60));
        aggregator.discard();
        assert!(aggregator.is_empty());
        assert!(aggregator.seen(DeviceColour::Green));
        assert!(!aggregator.seen(DeviceColour::Red));
    }

    #[test]
    fn test_cycle_message_serialization() {
        let mut aggregator = Aggregator::new();
        aggregator.upsert(DeviceColour::Red, metrics(DeviceColour::Red, 70, 1.05, -60));
        let message = aggregator.flush();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["Red"]["Temperature[degF]"], json!(70));
        assert_eq!(json["Red"]["Signal strength[dBm]"], json!(-60));
    }
}
