//! Small shared helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// POSIX microseconds for a file timestamp, truncated from nanoseconds.
pub fn system_time_to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// Inverse of [`system_time_to_micros`].
pub fn micros_to_system_time(micros: i64) -> SystemTime {
    if micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs())
    }
}

/// Strip the leading separator so an absolute path can be re-rooted under a
/// destination directory.
pub fn path_without_leading_separator(path: &str) -> &str {
    path.trim_start_matches(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_roundtrip() {
        let now = UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456);
        let micros = system_time_to_micros(now);
        assert_eq!(micros, 1_700_000_000_123_456);
        assert_eq!(micros_to_system_time(micros), now);
    }

    #[test]
    fn nanoseconds_truncate_to_micros() {
        let t = UNIX_EPOCH + Duration::from_nanos(5_000_000_789);
        assert_eq!(system_time_to_micros(t), 5_000_000);
    }

    #[test]
    fn leading_separator_stripping() {
        assert_eq!(path_without_leading_separator("/a/b/c"), "a/b/c");
        assert_eq!(path_without_leading_separator("a/b"), "a/b");
    }
}
