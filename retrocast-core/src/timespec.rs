/// Parses either plain seconds (`"90"`, `"12.5"`) or a colon separated
/// clock (`"1:30"`, `"01:02:03"`). The rightmost segment is seconds and each
/// segment to its left is worth sixty times more. Empty segments are skipped;
/// a negative or non-finite segment rejects the whole value.
pub fn parse_time_spec(spec: &str) -> Option<f64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }

    if spec.contains(':') {
        let mut total = 0.0;
        let mut multiplier = 1.0;
        for part in spec.rsplit(':') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let value: f64 = part.parse().ok()?;
            if !value.is_finite() || value < 0.0 {
                return None;
            }
            total += value * multiplier;
            multiplier *= 60.0;
        }
        return Some(total);
    }

    match spec.parse::<f64>() {
        Ok(value) if value >= 0.0 && value.is_finite() => Some(value),
        _ => None,
    }
}

/// Clamps an offset to zero or more and renders it with millisecond precision.
pub fn format_offset(seconds: f64) -> String {
    format!("{:.3}", clamp_offset(seconds))
}

pub fn clamp_offset(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}
