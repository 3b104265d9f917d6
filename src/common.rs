use std::{ops::Deref, time::Duration};

/// Tokens granted per second.
///
/// Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Rate(f64);

impl Deref for Rate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for Rate {
    type Error = &'static str;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value.is_finite() && value > 0f64 {
            Ok(Self(value))
        } else {
            Err("Rate must be greater than 0")
        }
    }
}

/// Maximum burst size of a bucket.
///
/// Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Capacity(f64);

impl Deref for Capacity {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for Capacity {
    type Error = &'static str;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value.is_finite() && value > 0f64 {
            Ok(Self(value))
        } else {
            Err("Capacity must be greater than 0")
        }
    }
}

/// Caller-supplied `(rate, capacity)` used when a key has no override.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDefaults {
    /// Default refill rate.
    pub rate: Rate,
    /// Default burst size.
    pub capacity: Capacity,
}

impl BucketDefaults {
    /// Build defaults from already validated parts.
    pub fn new(rate: Rate, capacity: Capacity) -> Self {
        Self { rate, capacity }
    }
}

/// Administrative per-key override record.
///
/// Each field is optional on its own: a present field replaces the caller's
/// default, an absent one keeps it. Values are stored as given and only
/// validated when a bucket resolves its effective config.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigOverride {
    /// Overridden refill rate.
    pub rate: Option<f64>,
    /// Overridden burst size.
    pub capacity: Option<f64>,
}

impl ConfigOverride {
    /// Set the rate field.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Set the capacity field.
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// `true` when neither field is set.
    pub fn is_empty(&self) -> bool {
        self.rate.is_none() && self.capacity.is_none()
    }
}

/// The `(rate, capacity)` pair actually applied to a bucket for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveConfig {
    rate: f64,
    capacity: f64,
}

impl EffectiveConfig {
    pub(crate) fn new(rate: f64, capacity: f64) -> Self {
        Self { rate, capacity }
    }

    /// Tokens granted per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens left, `0 <= tokens_remaining <= capacity`.
    pub tokens_remaining: f64,
    /// Store-clock time of the last refill, in seconds since the Unix epoch.
    pub last_refill_time: f64,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    /// The work may proceed; the requested tokens were consumed.
    Admitted {
        /// Tokens left after consumption.
        tokens_remaining: f64,
    },
    /// The work must wait. Nothing was consumed.
    Denied {
        /// Earliest store-clock time (seconds since the Unix epoch) at which a
        /// retry can succeed.
        retry_after: f64,
        /// `retry_after` relative to the store clock at decision time.
        retry_in: Duration,
        /// Tokens available at decision time.
        tokens_remaining: f64,
    },
}

impl RateLimitDecision {
    /// `true` for [`RateLimitDecision::Admitted`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateLimitDecision::Admitted { .. })
    }
}

/// Seconds to a [`Duration`], saturating on values a `Duration` cannot hold.
pub(crate) fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds <= 0f64 || seconds.is_nan() {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// Random pause added on top of a retry wait so that callers denied together
/// do not come back together.
pub(crate) fn retry_jitter() -> Duration {
    Duration::from_millis(rand::random_range(10..=100))
}
