#![cfg(feature = "redis-tokio")]

use std::{env, sync::Arc, thread, time::Duration};

use bucketgate::local::LocalTokenBucketOptions;
use bucketgate::redis::{RedisKey, RedisTokenBucketOptions};
use bucketgate::{
    BucketDefaults, Capacity, ConfigOverride, Rate, RateLimitDecision, RateLimiter,
    RateLimiterOptions,
};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_prefix() -> RedisKey {
    let n: u64 = rand::random();
    RedisKey::try_from(format!("bucketgate_itest_{n}")).unwrap()
}

fn key(s: &str) -> RedisKey {
    RedisKey::try_from(s.to_string()).unwrap()
}

fn defaults(rate: f64, capacity: f64) -> BucketDefaults {
    BucketDefaults::new(
        Rate::try_from(rate).unwrap(),
        Capacity::try_from(capacity).unwrap(),
    )
}

async fn build_rate_limiter(url: &str, prefix: &RedisKey) -> Arc<RateLimiter> {
    let client = redis::Client::open(url).unwrap();
    let connection_manager = client.get_connection_manager().await.unwrap();

    Arc::new(RateLimiter::new(RateLimiterOptions {
        local: LocalTokenBucketOptions::default(),
        redis: RedisTokenBucketOptions {
            connection_manager,
            prefix: Some(prefix.clone()),
            idle_ttl: None,
        },
    }))
}

#[test]
fn burst_deny_then_refill() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix()).await;
        let k = key("origin_a");
        let defaults = defaults(2f64, 10f64);

        for _ in 0..10 {
            let d = rl.redis().acquire_one(&k, &defaults).await.unwrap();
            assert!(d.is_admitted(), "{d:?}");
        }

        let RateLimitDecision::Denied { retry_in, .. } =
            rl.redis().acquire_one(&k, &defaults).await.unwrap()
        else {
            panic!("expected denied after the burst");
        };
        // deficit of about one token at 2 per second
        assert!(retry_in <= Duration::from_millis(500), "{retry_in:?}");
        assert!(retry_in > Duration::from_millis(300), "{retry_in:?}");

        thread::sleep(retry_in + Duration::from_millis(50));

        let d = rl.redis().acquire_one(&k, &defaults).await.unwrap();
        assert!(d.is_admitted(), "{d:?}");
    });
}

#[test]
fn limiters_sharing_a_prefix_share_buckets() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        // two independent handles, as if in two processes
        let prefix = unique_prefix();
        let first = build_rate_limiter(&url, &prefix).await;
        let second = build_rate_limiter(&url, &prefix).await;
        let defaults = defaults(0.001, 20f64);

        let mut tasks = Vec::new();
        for i in 0..60 {
            let rl = if i % 2 == 0 {
                first.clone()
            } else {
                second.clone()
            };
            tasks.push(tokio::spawn(async move {
                rl.redis()
                    .acquire_one(&key("shared"), &defaults)
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_admitted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    });
}

#[test]
fn override_set_on_one_limiter_applies_to_another() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let prefix = unique_prefix();
        let admin = build_rate_limiter(&url, &prefix).await;
        let worker = build_rate_limiter(&url, &prefix).await;
        let k = key("tuned");

        admin
            .redis()
            .set_override(&k, ConfigOverride::default().with_capacity(1f64))
            .await
            .unwrap();

        let defaults = defaults(0.001, 100f64);
        assert!(
            worker
                .redis()
                .acquire_one(&k, &defaults)
                .await
                .unwrap()
                .is_admitted()
        );
        assert!(
            !worker
                .redis()
                .acquire_one(&k, &defaults)
                .await
                .unwrap()
                .is_admitted()
        );
    });
}

#[test]
fn script_cache_flush_is_recovered() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix()).await;
        let k = key("flushed");
        let defaults = defaults(1f64, 5f64);

        rl.redis().acquire_one(&k, &defaults).await.unwrap();

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: () = redis::cmd("SCRIPT")
            .arg("FLUSH")
            .query_async(&mut conn)
            .await
            .unwrap();

        let d = rl.redis().acquire_one(&k, &defaults).await.unwrap();
        assert!(d.is_admitted(), "{d:?}");
    });
}

#[test]
fn local_and_redis_stores_are_independent() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let rl = build_rate_limiter(&url, &unique_prefix()).await;
        let defaults = defaults(0.001, 1f64);

        assert!(rl.local().acquire_one("k", &defaults).unwrap().is_admitted());
        assert!(!rl.local().acquire_one("k", &defaults).unwrap().is_admitted());

        let d = rl.redis().acquire_one(&key("k"), &defaults).await.unwrap();
        assert!(d.is_admitted(), "{d:?}");
    });
}
