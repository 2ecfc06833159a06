use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";

/// Mutable record of one rate-limit key's consumption state.
///
/// Created lazily on first use of a key and only ever mutated while the
/// dispatcher holds the bucket's guard, by merging `x-ratelimit-*`
/// response headers. A fresh bucket is unlimited (`limit`/`remaining`
/// unknown) until the server reports otherwise.
#[derive(Debug, Default)]
pub struct RateLimitBucket {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset_at: Option<SystemTime>,
    reset_after: Option<Duration>,
    bucket_id: Option<String>,
}

impl RateLimitBucket {
    /// How long a caller has to wait before the next request on this
    /// bucket may go out. `None` means the request may proceed now.
    ///
    /// The server clock may lead the local clock; callers are expected to
    /// sleep the returned duration and then re-check until this returns
    /// `None`.
    pub fn cooldown(&self, now: SystemTime) -> Option<Duration> {
        let remaining = self.remaining?;
        if remaining >= 1 {
            return None;
        }
        let reset_at = self.reset_at?;
        match reset_at.duration_since(now) {
            Ok(wait) if !wait.is_zero() => Some(wait),
            _ => None,
        }
    }

    /// Merges rate-limit response headers into the bucket.
    ///
    /// Every header is optional; an absent or malformed header leaves the
    /// corresponding field untouched (the server omits headers on some
    /// routes). When only `x-ratelimit-reset-after` is present the reset
    /// instant is derived from the local clock, so an exhausted bucket
    /// still cools down. `remaining` never increases within the same
    /// reset window; a later `x-ratelimit-reset` opens a new window and
    /// the reported value is taken verbatim.
    pub fn update(&mut self, headers: &HashMap<String, String>) {
        if let Some(limit) = parse_u64(headers, HEADER_LIMIT) {
            self.limit = Some(limit);
        }

        let new_reset_after = parse_f64(headers, HEADER_RESET_AFTER).map(Duration::from_secs_f64);
        if let Some(after) = new_reset_after {
            self.reset_after = Some(after);
        }

        let new_reset = parse_f64(headers, HEADER_RESET)
            .map(|epoch| UNIX_EPOCH + Duration::from_secs_f64(epoch))
            // some routes only report the relative variant
            .or_else(|| new_reset_after.map(|after| SystemTime::now() + after));
        let new_window = match (new_reset, self.reset_at) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            _ => false,
        };
        if let Some(reset_at) = new_reset {
            self.reset_at = Some(reset_at);
        }

        if let Some(reported) = parse_u64(headers, HEADER_REMAINING) {
            self.remaining = Some(match self.remaining {
                Some(current) if !new_window => current.min(reported),
                _ => reported,
            });
        }

        if let Some(id) = headers.get(HEADER_BUCKET) {
            self.bucket_id = Some(id.clone());
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn reset_at(&self) -> Option<SystemTime> {
        self.reset_at
    }

    pub fn reset_after(&self) -> Option<Duration> {
        self.reset_after
    }

    /// The server-assigned bucket id, once one has been observed. Multiple
    /// rate-limit keys may resolve to the same id.
    pub fn bucket_id(&self) -> Option<&str> {
        self.bucket_id.as_deref()
    }
}

fn parse_u64(headers: &HashMap<String, String>, name: &str) -> Option<u64> {
    let value = headers.get(name)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::debug!("ignoring malformed {} header: {:?}", name, value);
            None
        }
    }
}

fn parse_f64(headers: &HashMap<String, String>, name: &str) -> Option<f64> {
    let value = headers.get(name)?;
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Some(n),
        _ => {
            log::debug!("ignoring malformed {} header: {:?}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn epoch_secs(at: SystemTime) -> f64 {
        at.duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
    }

    #[test]
    fn fresh_bucket_is_unlimited() {
        let bucket = RateLimitBucket::default();
        assert_eq!(bucket.cooldown(SystemTime::now()), None);
    }

    #[test]
    fn merges_all_headers() {
        let now = SystemTime::now();
        let reset = now + Duration::from_secs(2);

        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[
            (HEADER_LIMIT, "5"),
            (HEADER_REMAINING, "4"),
            (HEADER_RESET, &format!("{:.3}", epoch_secs(reset))),
            (HEADER_RESET_AFTER, "2.000"),
            (HEADER_BUCKET, "abcd1234"),
        ]));

        assert_eq!(bucket.limit(), Some(5));
        assert_eq!(bucket.remaining(), Some(4));
        assert_eq!(bucket.reset_after(), Some(Duration::from_secs(2)));
        assert_eq!(bucket.bucket_id(), Some("abcd1234"));
        assert_eq!(bucket.cooldown(now), None);
    }

    #[test]
    fn exhausted_bucket_reports_a_cooldown() {
        let now = SystemTime::now();
        let reset = now + Duration::from_secs(1);

        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[
            (HEADER_REMAINING, "0"),
            (HEADER_RESET, &format!("{}", epoch_secs(reset))),
        ]));

        let wait = bucket.cooldown(now).unwrap();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
        assert_eq!(bucket.cooldown(reset), None);
        assert_eq!(bucket.cooldown(reset + Duration::from_secs(1)), None);
    }

    #[test]
    fn reset_after_alone_still_cools_down() {
        let now = SystemTime::now();

        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[
            (HEADER_REMAINING, "0"),
            (HEADER_RESET_AFTER, "5.0"),
        ]));

        let wait = bucket.cooldown(now).unwrap();
        assert!(wait > Duration::from_millis(4900) && wait < Duration::from_millis(5200));
        assert_eq!(bucket.cooldown(now + Duration::from_secs(6)), None);
    }

    #[test]
    fn absent_headers_leave_fields_untouched() {
        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[(HEADER_LIMIT, "5"), (HEADER_REMAINING, "3")]));
        bucket.update(&headers(&[]));

        assert_eq!(bucket.limit(), Some(5));
        assert_eq!(bucket.remaining(), Some(3));
    }

    #[test]
    fn malformed_headers_leave_fields_untouched() {
        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[(HEADER_REMAINING, "3")]));
        bucket.update(&headers(&[
            (HEADER_REMAINING, "soon"),
            (HEADER_RESET, "NaN"),
        ]));

        assert_eq!(bucket.remaining(), Some(3));
        assert_eq!(bucket.reset_at(), None);
    }

    #[test]
    fn remaining_is_monotonic_within_one_window() {
        let reset = SystemTime::now() + Duration::from_secs(5);
        let reset_header = format!("{}", epoch_secs(reset));

        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[
            (HEADER_REMAINING, "2"),
            (HEADER_RESET, &reset_header),
        ]));
        // a stale response arriving out of order must not bump remaining
        bucket.update(&headers(&[
            (HEADER_REMAINING, "4"),
            (HEADER_RESET, &reset_header),
        ]));
        assert_eq!(bucket.remaining(), Some(2));
    }

    #[test]
    fn a_new_window_resets_remaining() {
        let reset = SystemTime::now() + Duration::from_secs(5);

        let mut bucket = RateLimitBucket::default();
        bucket.update(&headers(&[
            (HEADER_REMAINING, "0"),
            (HEADER_RESET, &format!("{}", epoch_secs(reset))),
        ]));
        bucket.update(&headers(&[
            (HEADER_REMAINING, "5"),
            (
                HEADER_RESET,
                &format!("{}", epoch_secs(reset + Duration::from_secs(5))),
            ),
        ]));
        assert_eq!(bucket.remaining(), Some(5));
    }
}
