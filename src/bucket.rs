//! Token bucket arithmetic shared by every store.
//!
//! [`resolve_config`] merges caller defaults with an optional override and
//! validates the result; [`step`] runs one refill-then-decide cycle. Neither does
//! I/O: a store is responsible for running both under one per-key critical
//! section and persisting what [`step`] returns. The Redis Lua script implements
//! the same rules statement for statement.

use crate::{
    BucketDefaults, BucketGateError, BucketState, ConfigOverride, EffectiveConfig,
    RateLimitDecision, common::seconds_to_duration,
};

/// Merge `defaults` with `config_override` field by field.
///
/// A field present in the override wins, an absent one keeps the default. The
/// merged pair must be strictly positive or the call fails with
/// [`BucketGateError::InvalidConfig`].
pub fn resolve_config(
    defaults: &BucketDefaults,
    config_override: Option<&ConfigOverride>,
) -> Result<EffectiveConfig, BucketGateError> {
    let mut rate = *defaults.rate;
    let mut capacity = *defaults.capacity;

    if let Some(config_override) = config_override {
        if let Some(value) = config_override.rate {
            rate = value;
        }
        if let Some(value) = config_override.capacity {
            capacity = value;
        }
    }

    // NaN fails both comparisons
    if !(rate > 0f64 && rate.is_finite()) || !(capacity > 0f64 && capacity.is_finite()) {
        return Err(BucketGateError::InvalidConfig { rate, capacity });
    }

    Ok(EffectiveConfig::new(rate, capacity))
}

/// Result of one engine cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BucketStep {
    pub decision: RateLimitDecision,
    /// Refilled and capped state, consumed when admitted.
    pub state: BucketState,
    /// Whether `state` has to be written back: the bucket was created, refilled
    /// or spent. A same-tick deny leaves the stored bucket as it was.
    pub persist: bool,
}

/// Refill `current` up to `now` and try to take `amount` tokens from it.
///
/// - A missing bucket starts full with `last_refill_time = now`.
/// - Elapsed time is clamped at zero, so a clock that steps backwards only
///   means no refill this call.
/// - The timestamp is only advanced when the refill is positive; calls landing
///   on the same tick leave it untouched.
/// - Tokens never exceed `capacity`, excess refill is dropped.
pub(crate) fn step(
    current: Option<BucketState>,
    config: &EffectiveConfig,
    now: f64,
    amount: u64,
) -> BucketStep {
    let rate = config.rate();
    let capacity = config.capacity();

    let (mut state, refilled) = match current {
        None => (
            BucketState {
                tokens_remaining: capacity,
                last_refill_time: now,
            },
            true,
        ),
        Some(previous) => {
            let elapsed = (now - previous.last_refill_time).max(0f64);
            let refill = elapsed * rate;
            let refilled = refill > 0f64;

            let state = BucketState {
                tokens_remaining: (previous.tokens_remaining + refill).min(capacity),
                last_refill_time: if refilled {
                    now
                } else {
                    previous.last_refill_time
                },
            };
            (state, refilled)
        }
    };

    let requested = amount as f64;

    if state.tokens_remaining >= requested {
        state.tokens_remaining -= requested;

        return BucketStep {
            decision: RateLimitDecision::Admitted {
                tokens_remaining: state.tokens_remaining,
            },
            state,
            persist: true,
        };
    }

    let wait = (requested - state.tokens_remaining) / rate;

    BucketStep {
        decision: RateLimitDecision::Denied {
            retry_after: now + wait,
            retry_in: seconds_to_duration(wait),
            tokens_remaining: state.tokens_remaining,
        },
        state,
        persist: refilled,
    }
}
