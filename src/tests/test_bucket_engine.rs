use std::time::Duration;

use crate::{
    BucketDefaults, BucketGateError, BucketState, Capacity, ConfigOverride, EffectiveConfig,
    Rate, RateLimitDecision,
    bucket::{resolve_config, step},
};

fn defaults(rate: f64, capacity: f64) -> BucketDefaults {
    BucketDefaults::new(
        Rate::try_from(rate).unwrap(),
        Capacity::try_from(capacity).unwrap(),
    )
}

fn config(rate: f64, capacity: f64) -> EffectiveConfig {
    resolve_config(&defaults(rate, capacity), None).unwrap()
}

#[test]
fn resolve_without_override_returns_defaults() {
    let effective = resolve_config(&defaults(2f64, 10f64), None).unwrap();
    assert_eq!(effective.rate(), 2f64);
    assert_eq!(effective.capacity(), 10f64);
}

#[test]
fn resolve_with_empty_override_returns_defaults() {
    let empty = ConfigOverride::default();
    let effective = resolve_config(&defaults(2f64, 10f64), Some(&empty)).unwrap();
    assert_eq!(effective, config(2f64, 10f64));
}

#[test]
fn resolve_merges_override_field_by_field() {
    let rate_only = ConfigOverride::default().with_rate(7f64);
    let effective = resolve_config(&defaults(2f64, 10f64), Some(&rate_only)).unwrap();
    assert_eq!(effective.rate(), 7f64);
    assert_eq!(effective.capacity(), 10f64);

    let capacity_only = ConfigOverride::default().with_capacity(3f64);
    let effective = resolve_config(&defaults(2f64, 10f64), Some(&capacity_only)).unwrap();
    assert_eq!(effective.rate(), 2f64);
    assert_eq!(effective.capacity(), 3f64);

    let both = ConfigOverride::default().with_rate(1f64).with_capacity(1f64);
    let effective = resolve_config(&defaults(2f64, 10f64), Some(&both)).unwrap();
    assert_eq!(effective, config(1f64, 1f64));
}

#[test]
fn resolve_rejects_non_positive_results() {
    for bad in [
        ConfigOverride::default().with_rate(0f64),
        ConfigOverride::default().with_rate(-2f64),
        ConfigOverride::default().with_capacity(0f64),
        ConfigOverride::default().with_capacity(f64::NAN),
        ConfigOverride::default().with_rate(f64::INFINITY),
    ] {
        let err = resolve_config(&defaults(2f64, 10f64), Some(&bad)).unwrap_err();
        assert!(
            matches!(err, BucketGateError::InvalidConfig { .. }),
            "unexpected error: {err:?}"
        );
    }
}

#[test]
fn cold_start_grants_full_burst() {
    let result = step(None, &config(2f64, 10f64), 100f64, 1);

    assert_eq!(
        result.decision,
        RateLimitDecision::Admitted {
            tokens_remaining: 9f64
        }
    );
    assert_eq!(
        result.state,
        BucketState {
            tokens_remaining: 9f64,
            last_refill_time: 100f64,
        }
    );
}

#[test]
fn cold_start_can_take_whole_capacity_at_once() {
    let result = step(None, &config(2f64, 10f64), 0f64, 10);
    assert!(result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 0f64);
}

#[test]
fn refill_is_capped_at_capacity() {
    let current = BucketState {
        tokens_remaining: 0f64,
        last_refill_time: 0f64,
    };

    // 1000s * 2/s would be 2000 tokens, capacity is 10
    let result = step(Some(current), &config(2f64, 10f64), 1000f64, 1);
    assert_eq!(result.state.tokens_remaining, 9f64);
    assert_eq!(result.state.last_refill_time, 1000f64);
}

#[test]
fn partial_refill_accumulates() {
    let current = BucketState {
        tokens_remaining: 0f64,
        last_refill_time: 0f64,
    };

    // 0.25s at 2/s refills half a token: not enough for one
    let result = step(Some(current), &config(2f64, 10f64), 0.25, 1);
    assert!(!result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 0.5);
    assert_eq!(result.state.last_refill_time, 0.25);

    let result = step(Some(result.state), &config(2f64, 10f64), 0.5, 1);
    assert!(result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 0f64);
}

#[test]
fn same_tick_keeps_timestamp_and_only_consumes() {
    let current = BucketState {
        tokens_remaining: 5f64,
        last_refill_time: 42f64,
    };

    let result = step(Some(current), &config(2f64, 10f64), 42f64, 1);
    assert_eq!(
        result.state,
        BucketState {
            tokens_remaining: 4f64,
            last_refill_time: 42f64,
        }
    );
}

#[test]
fn backwards_clock_is_clamped_to_no_refill() {
    let current = BucketState {
        tokens_remaining: 1f64,
        last_refill_time: 50f64,
    };

    let result = step(Some(current), &config(2f64, 10f64), 40f64, 1);
    assert!(result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 0f64);
    // timestamp never moves backwards
    assert_eq!(result.state.last_refill_time, 50f64);
}

#[test]
fn denied_carries_exact_retry_after() {
    let current = BucketState {
        tokens_remaining: 0.5,
        last_refill_time: 10f64,
    };

    // deficit = 3 - 0.5 = 2.5, wait = 2.5 / 2 = 1.25
    let result = step(Some(current), &config(2f64, 10f64), 10f64, 3);

    assert_eq!(
        result.decision,
        RateLimitDecision::Denied {
            retry_after: 11.25,
            retry_in: Duration::from_millis(1250),
            tokens_remaining: 0.5,
        }
    );
    assert_eq!(result.state, current);
}

#[test]
fn denied_does_not_consume() {
    let current = BucketState {
        tokens_remaining: 2f64,
        last_refill_time: 0f64,
    };

    let result = step(Some(current), &config(1f64, 10f64), 0f64, 3);
    assert!(!result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 2f64);
}

#[test]
fn lowered_capacity_clamps_stored_tokens() {
    let current = BucketState {
        tokens_remaining: 10f64,
        last_refill_time: 0f64,
    };

    let result = step(Some(current), &config(1f64, 3f64), 0f64, 1);
    assert_eq!(result.state.tokens_remaining, 2f64);
}

#[test]
fn amount_above_capacity_is_always_denied() {
    let result = step(None, &config(1f64, 5f64), 0f64, 6);

    let RateLimitDecision::Denied {
        retry_after,
        tokens_remaining,
        ..
    } = result.decision
    else {
        panic!("expected denied, got {:?}", result.decision);
    };

    assert_eq!(tokens_remaining, 5f64);
    assert_eq!(retry_after, 1f64);
    // the cold-start bucket is still created
    assert_eq!(result.state.tokens_remaining, 5f64);
}

#[test]
fn tokens_stay_within_bounds_over_a_call_sequence() {
    let config = config(3f64, 7f64);
    let mut state = None;
    let mut last_refill_time = f64::MIN;

    let mut now = 0f64;
    for i in 0..500u64 {
        // irregular steps, including repeats and small backwards jumps
        now += match i % 7 {
            0 => 0f64,
            1 => 0.01,
            2 => 0.5,
            3 => -0.2,
            4 => 2f64,
            5 => 0.1,
            _ => 0f64,
        };

        let result = step(state, &config, now, 1 + i % 3);

        assert!(result.state.tokens_remaining >= 0f64);
        assert!(result.state.tokens_remaining <= config.capacity());
        assert!(result.state.last_refill_time >= last_refill_time);

        last_refill_time = result.state.last_refill_time;
        state = Some(result.state);
    }
}

#[test]
fn persist_only_when_created_refilled_or_spent() {
    let cold = step(None, &config(2f64, 10f64), 0f64, 11);
    assert!(!cold.decision.is_admitted());
    assert!(cold.persist);

    let current = BucketState {
        tokens_remaining: 1f64,
        last_refill_time: 5f64,
    };

    let admitted = step(Some(current), &config(2f64, 10f64), 5f64, 1);
    assert!(admitted.persist);

    let refilled_denied = step(Some(current), &config(2f64, 10f64), 5.25, 3);
    assert!(!refilled_denied.decision.is_admitted());
    assert!(refilled_denied.persist);

    let same_tick_denied = step(Some(current), &config(2f64, 10f64), 5f64, 3);
    assert!(!same_tick_denied.persist);
}

#[test]
fn same_tick_deny_under_lowered_capacity_is_not_persisted() {
    let current = BucketState {
        tokens_remaining: 9f64,
        last_refill_time: 0f64,
    };

    // capacity lowered to 2 by an override, same tick, asking for more than fits
    let result = step(Some(current), &config(1f64, 2f64), 0f64, 5);

    assert!(!result.decision.is_admitted());
    assert_eq!(result.state.tokens_remaining, 2f64);
    assert!(!result.persist);
}
