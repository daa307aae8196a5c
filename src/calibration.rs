//! Per-colour calibration curves.
//!
//! Operators measure a handful of reference points for each Tilt (for example
//! the Tilt reading in plain water and in a sugar solution of known gravity)
//! and list them in a table file:
//!
//! ```text
//! # colour, uncalibrated, calibrated
//! Red, 1.000, 1.002
//! Red, 1.026, 1.030
//! Red, 1.050, 1.055
//! Red, 1.074, 1.080
//! ```
//!
//! A cubic polynomial is fitted through the points of each colour with least
//! squares and used to correct later readings. Colours without enough distinct
//! points stay uncalibrated.
//!
//! Nothing in here is fatal: a missing file, unknown colours and malformed lines
//! are logged and skipped so the service keeps publishing raw readings.

use crate::colour::{DeviceColour, ParseColourError};
use crate::convert::round_to;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// Number of coefficients of a fitted curve (cubic polynomial).
pub const CURVE_COEFFICIENTS: usize = 4;

/// Calibration points per colour, as `(uncalibrated, calibrated)` pairs in file order.
pub type CalibrationTable = BTreeMap<DeviceColour, Vec<(f64, f64)>>;

/// Reasons a single table line is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("expected 3 fields (colour, uncalibrated, calibrated), got {0}")]
    FieldCount(usize),
    #[error(transparent)]
    UnknownColour(#[from] ParseColourError),
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
}

/// A fitted cubic correction curve.
///
/// The polynomial is fitted in a normalised coordinate `t = (x - center) / scale`,
/// which keeps the least-squares system well conditioned for inputs such as
/// specific gravity where all points sit close to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationCurve {
    /// Coefficients in ascending powers of `t`
    coefficients: [f64; CURVE_COEFFICIENTS],
    center: f64,
    scale: f64,
}

impl CalibrationCurve {
    /// Evaluate the curve at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        let t = (x - self.center) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, coefficient| acc * t + coefficient)
    }
}

/// Fit a least-squares cubic through `points`.
///
/// Returns `None` when fewer than four distinct x values are given (the fit
/// would be under-determined) or when the normal equations are singular.
pub fn fit_cubic(points: &[(f64, f64)]) -> Option<CalibrationCurve> {
    if distinct_x_count(points) < CURVE_COEFFICIENTS {
        return None;
    }

    let center = points.iter().map(|(x, _)| x).sum::<f64>() / points.len() as f64;
    let scale = points
        .iter()
        .map(|(x, _)| (x - center).abs())
        .fold(0.0, f64::max);
    if !scale.is_normal() {
        return None;
    }

    // Normal equations: (VᵀV) c = Vᵀy, with V the Vandermonde matrix of t.
    let mut power_sums = [0.0; 2 * CURVE_COEFFICIENTS - 1];
    let mut rhs = [0.0; CURVE_COEFFICIENTS];
    for &(x, y) in points {
        let t = (x - center) / scale;
        let mut tk = 1.0;
        for (k, sum) in power_sums.iter_mut().enumerate() {
            *sum += tk;
            if k < CURVE_COEFFICIENTS {
                rhs[k] += tk * y;
            }
            tk *= t;
        }
    }

    let mut matrix = [[0.0; CURVE_COEFFICIENTS]; CURVE_COEFFICIENTS];
    for (row, cells) in matrix.iter_mut().enumerate() {
        for (col, cell) in cells.iter_mut().enumerate() {
            *cell = power_sums[row + col];
        }
    }

    let coefficients = solve(matrix, rhs)?;
    Some(CalibrationCurve {
        coefficients,
        center,
        scale,
    })
}

fn distinct_x_count(points: &[(f64, f64)]) -> usize {
    let mut xs: Vec<f64> = points.iter().map(|(x, _)| *x).collect();
    xs.sort_by(f64::total_cmp);
    xs.dedup();
    xs.len()
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
fn solve(
    mut a: [[f64; CURVE_COEFFICIENTS]; CURVE_COEFFICIENTS],
    mut b: [f64; CURVE_COEFFICIENTS],
) -> Option<[f64; CURVE_COEFFICIENTS]> {
    const N: usize = CURVE_COEFFICIENTS;
    const SINGULAR_EPSILON: f64 = 1e-12;

    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < SINGULAR_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Parse one table line into `(colour, uncalibrated, calibrated)`.
fn parse_record(line: &str) -> Result<(DeviceColour, f64, f64), RecordError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [colour, uncalibrated, calibrated] = fields.as_slice() else {
        return Err(RecordError::FieldCount(fields.len()));
    };

    let colour: DeviceColour = colour.parse()?;
    let number = |s: &str| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| RecordError::InvalidNumber(s.to_string()))
    };

    Ok((colour, number(*uncalibrated)?, number(*calibrated)?))
}

/// Read a calibration table, skipping lines that cannot be used.
///
/// Blank lines and lines starting with `#` are ignored silently; every other
/// rejected line is logged as a warning together with `source` and its line number.
pub fn parse_table<R: BufRead>(reader: R, source: &str) -> CalibrationTable {
    let mut table = CalibrationTable::new();

    for (index, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            // The bytes of the line are already consumed; carry on with the next one
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("{source}:{}: skipping line that is not valid UTF-8", index + 1);
                continue;
            }
            Err(e) => {
                warn!("{source}: stopped reading at line {}: {e}", index + 1);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match parse_record(trimmed) {
            Ok((colour, uncalibrated, calibrated)) => {
                table
                    .entry(colour)
                    .or_default()
                    .push((uncalibrated, calibrated));
            }
            Err(e) => warn!("{source}:{}: skipping record: {e}", index + 1),
        }
    }

    table
}

/// Calibration curves for all colours of one metric (gravity or temperature).
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    curves: HashMap<DeviceColour, CalibrationCurve>,
}

impl Calibrator {
    /// A calibrator without any curves; every lookup passes through as `None`.
    pub fn uncalibrated() -> Self {
        Self::default()
    }

    /// Load a calibration table file and fit a curve per colour.
    ///
    /// A missing or unreadable file is logged and yields an uncalibrated instance.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => Self::from_reader(BufReader::new(file), &path.display().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Calibration file {} not found, readings stay uncalibrated",
                    path.display()
                );
                Self::uncalibrated()
            }
            Err(e) => {
                warn!(
                    "Cannot open calibration file {}: {e}, readings stay uncalibrated",
                    path.display()
                );
                Self::uncalibrated()
            }
        }
    }

    /// Parse a calibration table from any reader and fit a curve per colour.
    pub fn from_reader<R: BufRead>(reader: R, source: &str) -> Self {
        Self::from_table(&parse_table(reader, source), source)
    }

    /// Fit curves for every colour of `table` that has enough distinct points.
    pub fn from_table(table: &CalibrationTable, source: &str) -> Self {
        let mut curves = HashMap::new();

        for (&colour, points) in table {
            match fit_cubic(points) {
                Some(curve) => {
                    info!(
                        "{source}: calibrated {colour} from {} points",
                        points.len()
                    );
                    curves.insert(colour, curve);
                }
                None => warn!(
                    "{source}: {colour} needs at least {CURVE_COEFFICIENTS} distinct points, \
                     got {}; leaving it uncalibrated",
                    distinct_x_count(points)
                ),
            }
        }

        Self { curves }
    }

    /// Whether a curve exists for `colour`.
    pub fn is_calibrated(&self, colour: DeviceColour) -> bool {
        self.curves.contains_key(&colour)
    }

    /// Calibrate `raw` for `colour` without rounding.
    ///
    /// Returns `None` when `colour` has no curve.
    pub fn evaluate(&self, colour: DeviceColour, raw: f64) -> Option<f64> {
        self.curves.get(&colour).map(|curve| curve.evaluate(raw))
    }

    /// Calibrate `raw` for `colour`, rounded to `round_digits` decimal places.
    pub fn apply(&self, colour: DeviceColour, raw: f64, round_digits: u32) -> Option<f64> {
        self.evaluate(colour, raw)
            .map(|value| round_to(value, round_digits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(x: f64) -> f64 {
        0.5 - 2.0 * x + 0.75 * x.powi(2) + 0.125 * x.powi(3)
    }

    #[test]
    fn test_fit_exact_cubic() {
        let points: Vec<(f64, f64)> = [-2.0, -1.0, 0.0, 1.5, 3.0, 4.0]
            .into_iter()
            .map(|x| (x, cubic(x)))
            .collect();

        let curve = fit_cubic(&points).unwrap();
        for x in [-1.5, 0.25, 2.0, 3.5] {
            assert!((curve.evaluate(x) - cubic(x)).abs() < 1e-9, "x = {x}");
        }
    }

    #[test]
    fn test_fit_exact_cubic_four_points() {
        let points: Vec<(f64, f64)> = [0.0, 1.0, 2.0, 3.0]
            .into_iter()
            .map(|x| (x, cubic(x)))
            .collect();

        let curve = fit_cubic(&points).unwrap();
        assert!((curve.evaluate(2.5) - cubic(2.5)).abs() < 1e-9);
    }

    #[test]
    fn test_fit_gravity_range() {
        // Linear offset of +3 points over the usual gravity range
        let points = [
            (1.000, 1.003),
            (1.020, 1.023),
            (1.040, 1.043),
            (1.060, 1.063),
            (1.080, 1.083),
        ];

        let curve = fit_cubic(&points).unwrap();
        assert!((curve.evaluate(1.050) - 1.053).abs() < 1e-9);
    }

    #[test]
    fn test_fit_least_squares_smooths_noise() {
        // Points scattered around y = x; the fit must stay close to the line.
        let points = [
            (0.0, 0.01),
            (1.0, 0.99),
            (2.0, 2.01),
            (3.0, 2.99),
            (4.0, 4.01),
            (5.0, 4.99),
        ];

        let curve = fit_cubic(&points).unwrap();
        assert!((curve.evaluate(2.5) - 2.5).abs() < 0.05);
    }

    #[test]
    fn test_fit_rejects_too_few_points() {
        assert!(fit_cubic(&[]).is_none());
        assert!(fit_cubic(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]).is_none());
    }

    #[test]
    fn test_fit_rejects_duplicate_x() {
        let points = [(1.0, 1.0), (1.0, 1.1), (2.0, 2.0), (3.0, 3.0), (3.0, 3.1)];
        assert!(fit_cubic(&points).is_none());

        let identical = [(1.05, 1.06); 6];
        assert!(fit_cubic(&identical).is_none());
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record("red, 1.000, 1.002"),
            Ok((DeviceColour::Red, 1.0, 1.002))
        );
        assert_eq!(
            parse_record("Black,70,71.5"),
            Ok((DeviceColour::Black, 70.0, 71.5))
        );
    }

    #[test]
    fn test_parse_record_errors() {
        assert_eq!(parse_record("Red, 1.0"), Err(RecordError::FieldCount(2)));
        assert_eq!(
            parse_record("Red, 1.0, 1.0, 1.0"),
            Err(RecordError::FieldCount(4))
        );
        assert_eq!(
            parse_record("Teal, 1.0, 1.0"),
            Err(RecordError::UnknownColour(ParseColourError(
                "Teal".to_string()
            )))
        );
        assert_eq!(
            parse_record("Red, one, 1.0"),
            Err(RecordError::InvalidNumber("one".to_string()))
        );
        assert_eq!(
            parse_record("Red, 1.0, NaN"),
            Err(RecordError::InvalidNumber("NaN".to_string()))
        );
    }

    #[test]
    fn test_parse_table_skips_bad_lines() {
        let input = "\
# colour, raw, calibrated
Red, 1.000, 1.002

RED, 1.010, 1.012
Teal, 1.0, 1.0
Red, x, 1.0
green, 1.000, 0.999
";
        let table = parse_table(input.as_bytes(), "test");
        assert_eq!(table.len(), 2);
        assert_eq!(table[&DeviceColour::Red], vec![(1.0, 1.002), (1.01, 1.012)]);
        assert_eq!(table[&DeviceColour::Green], vec![(1.0, 0.999)]);
    }

    #[test]
    fn test_parse_table_skips_non_utf8_lines() {
        // Latin-1 degree sign in a comment, then a degree sign in a record
        let mut input = b"# temperatures in \xB0F\n".to_vec();
        input.extend_from_slice(b"Red, 60, 61\nRed, 65\xB0, 66\n");
        input.extend_from_slice(b"Red, 70, 71\nRed, 75, 76\nRed, 80, 81\n");

        let table = parse_table(input.as_slice(), "test");
        assert_eq!(
            table[&DeviceColour::Red],
            vec![(60.0, 61.0), (70.0, 71.0), (75.0, 76.0), (80.0, 81.0)]
        );

        let calibrator = Calibrator::from_reader(input.as_slice(), "test");
        assert_eq!(calibrator.apply(DeviceColour::Red, 68.0, 2), Some(69.0));
    }

    #[test]
    fn test_calibrator_apply() {
        let mut input = String::new();
        for x in [60.0, 65.0, 70.0, 75.0, 80.0] {
            input.push_str(&format!("Purple, {x}, {}\n", x + 1.5));
        }
        input.push_str("Red, 70, 71\nRed, 80, 81\n");

        let calibrator = Calibrator::from_reader(input.as_bytes(), "test");
        assert!(calibrator.is_calibrated(DeviceColour::Purple));
        assert_eq!(calibrator.apply(DeviceColour::Purple, 68.0, 2), Some(69.5));
        // Only two points for Red
        assert!(!calibrator.is_calibrated(DeviceColour::Red));
        assert_eq!(calibrator.apply(DeviceColour::Red, 70.0, 2), None);
        // Nothing at all for Blue
        assert_eq!(calibrator.apply(DeviceColour::Blue, 70.0, 2), None);
    }

    #[test]
    fn test_calibrator_apply_rounds() {
        let points: Vec<(f64, f64)> = [1.0, 1.02, 1.04, 1.06]
            .into_iter()
            .map(|x| (x, x + 0.00123))
            .collect();
        let mut table = CalibrationTable::new();
        table.insert(DeviceColour::Yellow, points);

        let calibrator = Calibrator::from_table(&table, "test");
        assert_eq!(calibrator.apply(DeviceColour::Yellow, 1.05, 3), Some(1.051));
        assert_eq!(calibrator.apply(DeviceColour::Yellow, 1.05, 5), Some(1.05123));
    }

    #[test]
    fn test_load_missing_file() {
        let calibrator = Calibrator::load("/nonexistent/tilt/SGCal.csv");
        for colour in DeviceColour::ALL {
            assert_eq!(calibrator.apply(colour, 1.05, 3), None);
        }
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!(
            "tilt-listener-calibration-{}.csv",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "Orange, 1.000, 1.001\nOrange, 1.010, 1.011\n\
             Orange, 1.020, 1.021\nOrange, 1.030, 1.031\n",
        )
        .unwrap();

        let calibrator = Calibrator::load(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(calibrator.apply(DeviceColour::Orange, 1.015, 3), Some(1.016));
    }
}
