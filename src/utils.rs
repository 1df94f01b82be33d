//! Duration parsing and rendering helpers.

use std::time::Duration;

/// Parses a duration string in the format "200ms", "10s", "3m".
///
/// Supported units:
/// - `ns`, `us` / `µs`, `ms` for sub-second values
/// - `s`, `m`, `h`, `d` for seconds and up
///
/// A bare `0` is accepted as the zero duration.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let unit_start = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration: '{}'", s))?;
    let (value_str, unit) = s.split_at(unit_start);

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value in duration: '{}'", value_str))?;

    match unit {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" | "µs" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        "d" => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "unknown duration unit: '{}'. Use ns, us, ms, s, m, h or d.",
            unit
        )),
    }
}

/// Renders a duration with its most natural unit: "750ns", "1.234ms",
/// "2.5s", "1m30s". The inverse of [`parse_duration_string`] for the
/// canonical single-unit forms.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", trim_fraction(nanos as f64 / 1e3, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", trim_fraction(nanos as f64 / 1e6, 3));
    }

    let secs = d.as_secs_f64();
    if secs < 60.0 {
        return format!("{}s", trim_fraction(secs, 6));
    }

    let whole = d.as_secs();
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let rem_secs = secs - (hours * 3600 + minutes * 60) as f64;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, trim_fraction(rem_secs, 6))
    } else {
        format!("{}m{}s", minutes, trim_fraction(rem_secs, 6))
    }
}

// Fixed-precision float with trailing zeros (and a bare point) removed.
fn trim_fraction(v: f64, precision: usize) -> String {
    let s = format!("{:.*}", precision, v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_units() {
        assert_eq!(
            parse_duration_string("200ms").unwrap(),
            Duration::from_millis(200)
        );
        assert_eq!(parse_duration_string("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration_string("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(
            parse_duration_string("2h").unwrap(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            parse_duration_string("1d").unwrap(),
            Duration::from_secs(86400)
        );
        assert_eq!(
            parse_duration_string("500ns").unwrap(),
            Duration::from_nanos(500)
        );
        assert_eq!(
            parse_duration_string("5us").unwrap(),
            Duration::from_micros(5)
        );
        assert_eq!(
            parse_duration_string("5µs").unwrap(),
            Duration::from_micros(5)
        );
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration_string("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("10x").is_err());
        assert!(parse_duration_string("ms").is_err());
        assert!(parse_duration_string("12").is_err());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
        assert_eq!(format_duration(Duration::from_micros(5)), "5µs");
        assert_eq!(format_duration(Duration::from_micros(1234)), "1.234ms");
        assert_eq!(format_duration(Duration::from_millis(200)), "200ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
    }

    #[test]
    fn test_parse_format_round_trip() {
        // Compound renderings like "1m30s" are display-only; the canonical
        // single-unit forms round-trip exactly.
        for s in ["1ns", "1µs", "1ms", "1s", "200ms", "45s"] {
            let d = parse_duration_string(s).unwrap();
            let rendered = format_duration(d);
            assert_eq!(parse_duration_string(&rendered).unwrap(), d);
        }
    }
}
