//! Human duration strings for the CLI (`500ms`, `30s`, `5m`, `1h`).

use std::time::Duration;

/// Parse `N[ms|s|m|h]`; a bare number is seconds. Fractions are allowed.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("duration must be positive: {s}"));
    }
    Duration::try_from_secs_f64(value * scale).map_err(|_| format!("duration out of range: {s}"))
}
