use std::time::{SystemTime, UNIX_EPOCH};

/// `Date` header value, reformatted at most once per second.
///
/// Each reactor owns one; nothing is shared across threads.
pub struct DateCache {
    secs: u64,
    value: String,
}

impl DateCache {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            secs: unix_secs(now),
            value: httpdate::fmt_http_date(now),
        }
    }

    /// Bring the cached value up to `now` and return it.
    pub fn refresh(&mut self, now: SystemTime) -> &str {
        let secs = unix_secs(now);
        if secs != self.secs {
            self.secs = secs;
            self.value = httpdate::fmt_http_date(now);
        }
        &self.value
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Drop the sub-second part; HTTP dates only carry whole seconds.
pub fn truncate_to_secs(t: SystemTime) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(unix_secs(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn refresh_only_changes_on_new_second() {
        let base = UNIX_EPOCH + Duration::from_secs(784_111_777);
        let mut cache = DateCache::new();
        assert_eq!(cache.refresh(base), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(
            cache.refresh(base + Duration::from_millis(900)),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
        assert_eq!(
            cache.refresh(base + Duration::from_secs(1)),
            "Sun, 06 Nov 1994 08:49:38 GMT"
        );
    }

    #[test]
    fn truncation_drops_fraction() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(truncate_to_secs(t), UNIX_EPOCH + Duration::from_secs(1));
    }
}
