use tollgate_clock::{DurationSecs, UnixTime};

/// Configuration for determining when a session should be renewed proactively
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LifetimePolicy {
    freshness_period: f64,
    min_delay: DurationSecs,
}

impl Default for LifetimePolicy {
    /// Default lifetime policy
    ///
    /// Uses a freshness period of 75% of the remaining lifetime, with no
    /// minimum delay.
    fn default() -> Self {
        Self {
            freshness_period: 0.75,
            min_delay: DurationSecs(0),
        }
    }
}

impl LifetimePolicy {
    /// Constructs a new lifetime policy
    ///
    /// A session using this policy will be considered stale once
    /// `freshness_period` (a ratio of the lifetime remaining when the session
    /// was last written) has elapsed, but never sooner than `min_delay`. The
    /// ratio is clamped into `[0, 1]`.
    pub fn new(freshness_period: f64, min_delay: DurationSecs) -> Self {
        let freshness_period = if freshness_period.is_nan() {
            0.
        } else {
            freshness_period.clamp(0., 1.)
        };

        Self {
            freshness_period,
            min_delay,
        }
    }

    /// The configured freshness ratio
    pub fn freshness_period(&self) -> f64 {
        self.freshness_period
    }

    /// Computes when a token expiring at `expires_at`, observed at `now`, becomes stale
    ///
    /// The result is never earlier than `now` and never later than `expires_at`.
    pub fn stale_at(&self, now: UnixTime, expires_at: UnixTime) -> UnixTime {
        let remaining = expires_at - now;
        let delay = (remaining * self.freshness_period)
            .max(self.min_delay)
            .min(remaining);
        now + delay
    }
}
