use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    BucketDefaults, BucketGateError, BucketState, Clock, ConfigOverride, EffectiveConfig,
    RateLimitDecision, SystemClock,
    bucket::{BucketStep, resolve_config, step},
    common::retry_jitter,
};

/// Configuration for [`LocalTokenBucket`].
#[derive(Clone)]
pub struct LocalTokenBucketOptions {
    /// Time source for every decision made by this store.
    ///
    /// Defaults to [`SystemClock`]. Tests usually pass a
    /// [`ManualClock`](crate::ManualClock).
    pub clock: Arc<dyn Clock>,
}

impl Default for LocalTokenBucketOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for LocalTokenBucketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTokenBucketOptions")
            .field("now", &self.clock.now())
            .finish()
    }
}

/// Token bucket store shared by every thread of the current process.
///
/// # Atomicity
///
/// [`acquire`](Self::acquire) holds the `DashMap` shard lock of the key's bucket
/// while it resolves the config, reads the clock, refills, decides and writes
/// back. Calls for the same key are therefore linearized; calls for keys in
/// different shards run in parallel.
///
/// # Memory growth
///
/// Buckets are never dropped on their own. Call [`cleanup`](Self::cleanup) or
/// start [`RateLimiter::run_cleanup_loop_with_config`](crate::RateLimiter::run_cleanup_loop_with_config).
///
/// # Examples
///
/// ```
/// use bucketgate::{BucketDefaults, Capacity, LocalTokenBucket, LocalTokenBucketOptions, Rate};
///
/// let buckets = LocalTokenBucket::new(LocalTokenBucketOptions::default());
/// let defaults = BucketDefaults::new(Rate::try_from(2.0).unwrap(), Capacity::try_from(10.0).unwrap());
///
/// let decision = buckets.acquire_one("origin_a", &defaults).unwrap();
/// assert!(decision.is_admitted());
/// ```
pub struct LocalTokenBucket {
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, BucketState>,
    overrides: DashMap<String, ConfigOverride>,
}

impl LocalTokenBucket {
    /// Create an empty store.
    pub fn new(options: LocalTokenBucketOptions) -> Self {
        Self {
            clock: options.clock,
            buckets: DashMap::new(),
            overrides: DashMap::new(),
        }
    } // end constructor

    pub(crate) fn buckets(&self) -> &DashMap<String, BucketState> {
        &self.buckets
    }

    /// Try to take `amount` tokens from the bucket of `key`.
    ///
    /// Returns [`RateLimitDecision::Admitted`] when the tokens were taken and
    /// [`RateLimitDecision::Denied`] with the earliest useful retry time
    /// otherwise.
    ///
    /// # Errors
    ///
    /// - [`BucketGateError::InvalidAmount`] when `amount` is zero.
    /// - [`BucketGateError::InvalidConfig`] when the override for `key` resolves
    ///   to a non-positive rate or capacity. No bucket is created or changed.
    pub fn acquire(
        &self,
        key: &str,
        defaults: &BucketDefaults,
        amount: u64,
    ) -> Result<RateLimitDecision, BucketGateError> {
        if amount == 0 {
            return Err(BucketGateError::InvalidAmount(amount));
        }

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            let result = self.decide(key, defaults, Some(*bucket), amount)?;
            if result.persist {
                *bucket = result.state;
            }
            return Ok(result.decision);
        }

        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let result = self.decide(key, defaults, Some(*occupied.get()), amount)?;
                if result.persist {
                    *occupied.get_mut() = result.state;
                }
                Ok(result.decision)
            }
            Entry::Vacant(vacant) => {
                let result = self.decide(key, defaults, None, amount)?;
                vacant.insert(result.state);
                Ok(result.decision)
            }
        }
    } // end method acquire

    /// [`acquire`](Self::acquire) a single token.
    pub fn acquire_one(
        &self,
        key: &str,
        defaults: &BucketDefaults,
    ) -> Result<RateLimitDecision, BucketGateError> {
        self.acquire(key, defaults, 1)
    }

    /// Keep calling [`acquire`](Self::acquire) until admitted or `max_wait` runs out.
    ///
    /// Between attempts the thread sleeps for the denied call's `retry_in` plus
    /// a random 10–100ms jitter. If that sleep would overrun `max_wait` the last
    /// [`RateLimitDecision::Denied`] is returned instead.
    pub fn acquire_with_retry(
        &self,
        key: &str,
        defaults: &BucketDefaults,
        amount: u64,
        max_wait: Duration,
    ) -> Result<RateLimitDecision, BucketGateError> {
        let started = Instant::now();

        loop {
            let decision = self.acquire(key, defaults, amount)?;

            let RateLimitDecision::Denied { retry_in, .. } = decision else {
                return Ok(decision);
            };

            let pause = retry_in.saturating_add(retry_jitter());
            if started.elapsed().saturating_add(pause) > max_wait {
                return Ok(decision);
            }

            tracing::debug!(key, ?pause, "bucketgate.retry.sleep");
            thread::sleep(pause);
        }
    } // end method acquire_with_retry

    /// Stored state of `key`, without refilling it.
    pub fn state(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|bucket| *bucket)
    }

    /// Forget the bucket of `key`. The next call for it is a cold start.
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Replace the override record of `key`.
    ///
    /// An empty override removes the record.
    pub fn set_override(&self, key: &str, config_override: ConfigOverride) {
        if config_override.is_empty() {
            self.overrides.remove(key);
        } else {
            self.overrides.insert(key.to_string(), config_override);
        }
    }

    /// Override record of `key`, if any.
    pub fn get_override(&self, key: &str) -> Option<ConfigOverride> {
        self.overrides.get(key).map(|config_override| *config_override)
    }

    /// Drop the override record of `key`.
    pub fn remove_override(&self, key: &str) {
        self.overrides.remove(key);
    }

    /// Drop buckets whose last refill is older than `stale_after`.
    ///
    /// A bucket idle for at least `capacity / rate` seconds is full again, so
    /// evicting it is indistinguishable from keeping it.
    pub fn cleanup(&self, stale_after: Duration) {
        let now = self.clock.now();
        let stale_after = stale_after.as_secs_f64();
        let before = self.buckets.len();

        self.buckets
            .retain(|_, bucket| now - bucket.last_refill_time <= stale_after);

        tracing::debug!(
            evicted = before.saturating_sub(self.buckets.len()),
            "bucketgate.cleanup.evicted"
        );
    } // end method cleanup

    fn effective_config(
        &self,
        key: &str,
        defaults: &BucketDefaults,
    ) -> Result<EffectiveConfig, BucketGateError> {
        let config_override = self.overrides.get(key);

        resolve_config(defaults, config_override.as_deref()).inspect_err(|err| {
            tracing::warn!(key, %err, "bucketgate.acquire.invalid_config");
        })
    }

    /// Runs with the bucket's shard lock held by the caller.
    fn decide(
        &self,
        key: &str,
        defaults: &BucketDefaults,
        current: Option<BucketState>,
        amount: u64,
    ) -> Result<BucketStep, BucketGateError> {
        let config = self.effective_config(key, defaults)?;
        let now = self.clock.now();

        Ok(step(current, &config, now, amount))
    }
} // end of impl
