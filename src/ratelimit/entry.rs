//! Rate limit entry: a counter bound to a fixed expiry.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// A counter tracking requests for one key within a fixed window.
///
/// Entries never roll over in place. Once `reset_time` is reached the entry is
/// considered expired and the store replaces it with a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Composite key this entry belongs to
    pub key: String,
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
}

impl RateLimitEntry {
    /// Start a new window for `key` at `now`.
    pub fn new(key: &str, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            count: 0,
            reset_time: now + window,
        }
    }

    /// Whether the window has ended. A request arriving exactly at
    /// `reset_time` belongs to the next window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_time <= now
    }

    /// Requests left under `ceiling` in this window.
    pub fn remaining(&self, ceiling: u64) -> u64 {
        ceiling.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let left = self.reset_time - now;
        if left <= Duration::zero() {
            return 0;
        }
        let whole = left.num_seconds();
        if left > Duration::seconds(whole) {
            whole as u64 + 1
        } else {
            whole as u64
        }
    }
}

/// Format a timestamp the way clients expect reset times: ISO-8601 in UTC
/// with millisecond precision, e.g. `2026-10-18T12:00:00.000Z`.
pub fn format_reset_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_entry_starts_empty() {
        let entry = RateLimitEntry::new("ip:1.2.3.4:/ai-search", at(0), Duration::hours(1));

        assert_eq!(entry.count, 0);
        assert_eq!(entry.reset_time, at(3600));
        assert_eq!(entry.remaining(10), 10);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = RateLimitEntry::new("k", at(0), Duration::seconds(60));

        assert!(!entry.is_expired(at(59)));
        assert!(entry.is_expired(at(60)));
        assert!(entry.is_expired(at(61)));
    }

    #[test]
    fn test_remaining_never_negative() {
        let mut entry = RateLimitEntry::new("k", at(0), Duration::seconds(60));
        entry.count = 12;

        assert_eq!(entry.remaining(10), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let entry = RateLimitEntry::new("k", at(0), Duration::milliseconds(1500));

        assert_eq!(entry.retry_after_secs(at(0)), 2);
        assert_eq!(entry.retry_after_secs(at(1)), 1);
        assert_eq!(entry.retry_after_secs(at(5)), 0);
    }

    #[test]
    fn test_retry_after_counts_sub_millisecond_remainders() {
        let entry = RateLimitEntry::new("k", at(0), Duration::seconds(60));

        let just_before = entry.reset_time - Duration::microseconds(500);
        assert_eq!(entry.retry_after_secs(just_before), 1);

        let just_before = entry.reset_time - Duration::nanoseconds(1);
        assert_eq!(entry.retry_after_secs(just_before), 1);

        let gap = Duration::milliseconds(1000) + Duration::microseconds(500);
        assert_eq!(entry.retry_after_secs(entry.reset_time - gap), 2);

        assert_eq!(entry.retry_after_secs(entry.reset_time - Duration::seconds(2)), 2);
        assert_eq!(entry.retry_after_secs(entry.reset_time), 0);
    }

    #[test]
    fn test_format_reset_time() {
        let time = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(format_reset_time(time), "2026-10-18T12:00:00.000Z");
    }
}
