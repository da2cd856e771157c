//! Decode progress parsing.
//!
//! The decoder reports progress on its stats channel as `time=HH:MM:SS.ss`
//! tokens. With the total duration probed up front, each token converts to a
//! percentage.

/// Extract the `time=` token from one stderr line and convert it to seconds.
///
/// Returns `None` for lines without a parseable token (including the
/// `time=N/A` the tool prints before the first frame).
pub fn parse_time_token(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + 5..];
    let token = rest.split_whitespace().next()?;
    parse_clock(token)
}

/// Parse `HH:MM:SS.ss` into seconds.
fn parse_clock(token: &str) -> Option<f64> {
    let token = token.strip_prefix('-').unwrap_or(token);
    let mut parts = token.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Convert elapsed seconds to a percentage of `total_seconds`, clamped to
/// [0, 100]. A zero or negative total yields 0.
pub fn percent_of(elapsed_seconds: f64, total_seconds: f64) -> f64 {
    if total_seconds <= 0.0 {
        return 0.0;
    }
    ((elapsed_seconds / total_seconds) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_token_from_stats_line() {
        let line = "frame= 1234 fps=120 q=-1.0 size=  2048KiB time=00:01:30.50 bitrate= 185.9kbits/s speed=3.9x";
        let secs = parse_time_token(line).unwrap();
        assert!((secs - 90.5).abs() < 1e-9);
    }

    #[test]
    fn ignores_lines_without_token() {
        assert_eq!(parse_time_token("Press [q] to stop"), None);
        assert_eq!(parse_time_token("time=N/A bitrate=N/A"), None);
    }

    #[test]
    fn parses_hours() {
        assert_eq!(parse_time_token("time=01:00:00.00"), Some(3600.0));
    }

    #[test]
    fn percent_is_clamped() {
        assert!((percent_of(45.0, 90.0) - 50.0).abs() < 1e-9);
        assert_eq!(percent_of(120.0, 90.0), 100.0);
        assert_eq!(percent_of(10.0, 0.0), 0.0);
    }
}
