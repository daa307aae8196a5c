//! Human-readable durations for command line flags.

use std::time::Duration;

/// Suffixes in matching order; `ms` must be tried before `m` and `s`.
const UNITS: [(&str, &str, u64); 4] = [
    ("ms", "milliseconds", 1),
    ("h", "hours", 3_600_000),
    ("m", "minutes", 60_000),
    ("s", "seconds", 1_000),
];

/// Parse a non-zero duration such as `5s`, `500ms`, `1m` or `2h`.
///
/// A bare number is taken as seconds.
///
/// # Examples
/// ```
/// use tilt_listener::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, unit, millis_per_unit) = UNITS
        .iter()
        .find_map(|&(suffix, unit, factor)| {
            src.strip_suffix(suffix).map(|number| (number, unit, factor))
        })
        .unwrap_or((src, "seconds", 1_000));

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {number}"))?;
    let millis = value
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("duration too long: {src}"))?;

    if millis == 0 {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(Duration::from_millis(millis))
}
