//! Unit conversions for hydrometer values.

/// Convert degrees Fahrenheit to degrees Celsius.
#[inline]
pub fn to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Convert specific gravity to degrees Plato.
///
/// Uses the common empirical cubic approximation, valid over the range of
/// gravities seen while brewing.
#[inline]
pub fn to_plato(sg: f64) -> f64 {
    -616.868 + 1111.14 * sg - 630.272 * sg.powi(2) + 135.997 * sg.powi(3)
}

/// Round `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}
