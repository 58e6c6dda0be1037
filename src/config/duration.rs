//! Duration strings used by `lease_ttl` and `lock.backoff`.

use std::time::Duration;

/// Parse a duration string like "500ms", "5s", "1m" or a bare number of
/// seconds. Returns `None` if the string cannot be parsed.
///
/// ```
/// use vm_ports::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("60s"), Some(Duration::from_secs(60)));
/// assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_duration_string("1m"), Some(Duration::from_secs(60)));
/// assert_eq!(parse_duration_string("30"), Some(Duration::from_secs(30)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Short human form for lease ages: `45s`, `3m12s`, `2h5m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration_string("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration_string("2m"), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_duration_string(" 250ms "),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_duration_string("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration_string(""), None);
        assert_eq!(parse_duration_string("soon"), None);
        assert_eq!(parse_duration_string("5x"), None);
        assert_eq!(parse_duration_string("-5s"), None);
        assert_eq!(parse_duration_string("1ss"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(192)), "3m12s");
        assert_eq!(format_duration(Duration::from_secs(7500)), "2h5m");
    }
}
