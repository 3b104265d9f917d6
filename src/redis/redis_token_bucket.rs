use std::{
    fmt,
    time::{Duration, Instant},
};

use redis::{Script, aio::ConnectionManager};

use crate::{
    BucketDefaults, BucketGateError, BucketState, ConfigOverride, RateLimitDecision,
    common::{retry_jitter, seconds_to_duration},
    redis::{RedisKey, RedisKeyGenerator},
    runtime,
};

/// Override merge, refill and decision in one atomic step.
///
/// KEYS: tokens, timestamp, config. ARGV: default rate, default capacity,
/// requested amount, idle ttl in ms (0 = none).
///
/// Reply: `{status, tokens_remaining, retry_after, wait}` as strings, since Lua
/// numbers are truncated to integers on the way out of a script.
const ACQUIRE_SCRIPT: &str = r#"
    local tokens_key = KEYS[1]
    local timestamp_key = KEYS[2]
    local config_key = KEYS[3]

    local rate_raw = ARGV[1]
    local capacity_raw = ARGV[2]
    local requested = tonumber(ARGV[3])
    local idle_ttl_ms = tonumber(ARGV[4]) or 0

    -- per-field override
    local override = redis.call("HMGET", config_key, "rate", "capacity")
    if override[1] then
        rate_raw = override[1]
    end
    if override[2] then
        capacity_raw = override[2]
    end

    local rate = tonumber(rate_raw)
    local capacity = tonumber(capacity_raw)

    if rate == nil or capacity == nil
        or rate ~= rate or capacity ~= capacity
        or rate <= 0 or capacity <= 0
        or rate == math.huge or capacity == math.huge then
        return {"invalid_config", rate_raw, capacity_raw, "0"}
    end

    local time_array = redis.call("TIME")
    local now = tonumber(time_array[1]) + tonumber(time_array[2]) / 1000000

    local state = redis.call("MGET", tokens_key, timestamp_key)
    local tokens = tonumber(state[1])
    local last_refill = tonumber(state[2])
    local refilled = false

    if tokens == nil or last_refill == nil then
        tokens = capacity
        last_refill = now
        refilled = true
    else
        local elapsed = math.max(now - last_refill, 0)
        local refill = elapsed * rate
        tokens = math.min(tokens + refill, capacity)

        if refill > 0 then
            last_refill = now
            refilled = true
        end
    end

    local admitted = tokens >= requested
    if admitted then
        tokens = tokens - requested
    end

    if refilled then
        redis.call("SET", timestamp_key, string.format("%.17g", last_refill))
    end

    if refilled or admitted then
        redis.call("SET", tokens_key, string.format("%.17g", tokens))

        if idle_ttl_ms > 0 then
            redis.call("PEXPIRE", tokens_key, idle_ttl_ms)
            redis.call("PEXPIRE", timestamp_key, idle_ttl_ms)
        end
    end

    if admitted then
        return {"admitted", string.format("%.17g", tokens), "0", "0"}
    end

    local wait = (requested - tokens) / rate

    return {
        "denied",
        string.format("%.17g", tokens),
        string.format("%.17g", now + wait),
        string.format("%.17g", wait),
    }
"#;

/// Configuration for [`RedisTokenBucket`].
///
/// # Requirements
///
/// - **Redis version:** >= 5.0 (scripts that read `TIME` before writing rely
///   on effect replication)
/// - **Runtime:** Tokio or Smol (via `redis-tokio` or `redis-smol` features)
///
/// # Examples
///
/// ```ignore
/// use bucketgate::{RedisKey, RedisTokenBucketOptions};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let connection_manager = client.get_connection_manager().await?;
///
/// let options = RedisTokenBucketOptions {
///     connection_manager,
///     prefix: Some(RedisKey::try_from("origin_guard")?), // Keys: origin_guard:{<key>}:...
///     idle_ttl: None,
/// };
/// ```
#[derive(Clone)]
pub struct RedisTokenBucketOptions {
    /// Redis connection manager from the `redis` crate.
    ///
    /// Reconnects on its own; cloned per call.
    pub connection_manager: ConnectionManager,

    /// Optional prefix for all Redis keys.
    ///
    /// Keys are laid out as `<prefix>:{<key>}:tokens`, `…:timestamp` and
    /// `…:config`. If `None`, defaults to `"bucketgate"`.
    pub prefix: Option<RedisKey>,

    /// Expiry refreshed on a bucket's `tokens` and `timestamp` keys every time
    /// they are written.
    ///
    /// `None` attaches no expiry, so buckets live until deleted. Picking a
    /// value of at least `capacity / rate` seconds never changes a decision: a
    /// bucket idle that long is full again anyway.
    pub idle_ttl: Option<Duration>,
}

impl fmt::Debug for RedisTokenBucketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTokenBucketOptions")
            .field("prefix", &self.prefix)
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}

/// Token bucket store shared through Redis.
///
/// Every [`acquire`](Self::acquire) runs the whole decision (override merge,
/// validation, `TIME`, refill, consume, write-back) as one Lua script, so Redis
/// executes calls for the same key one after another and two callers can never
/// both spend the same token. The script is sent by SHA and reloaded
/// automatically after a `NOSCRIPT`.
///
/// # Examples
///
/// ```ignore
/// use bucketgate::{BucketDefaults, Capacity, Rate, RateLimitDecision, RedisKey};
///
/// let defaults = BucketDefaults::new(Rate::try_from(2.0)?, Capacity::try_from(10.0)?);
/// let key = RedisKey::try_from("origin_a")?;
///
/// match rl.redis().acquire_one(&key, &defaults).await? {
///     RateLimitDecision::Admitted { .. } => { /* fetch from origin */ }
///     RateLimitDecision::Denied { retry_in, .. } => { /* back off for retry_in */ }
/// }
/// ```
pub struct RedisTokenBucket {
    connection_manager: ConnectionManager,
    key_generator: RedisKeyGenerator,
    idle_ttl_ms: u64,
    acquire_script: Script,
}

impl RedisTokenBucket {
    pub(crate) fn new(options: RedisTokenBucketOptions) -> Self {
        let prefix = options.prefix.unwrap_or_else(RedisKey::default_prefix);
        let idle_ttl_ms = options
            .idle_ttl
            .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
            .unwrap_or(0);

        Self {
            connection_manager: options.connection_manager,
            key_generator: RedisKeyGenerator::new(prefix),
            idle_ttl_ms,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
        }
    }

    /// Try to take `amount` tokens from the bucket of `key`.
    ///
    /// # Errors
    ///
    /// - [`BucketGateError::InvalidAmount`] when `amount` is zero.
    /// - [`BucketGateError::InvalidConfig`] or [`BucketGateError::InvalidOverride`]
    ///   when the override record of `key` does not resolve to a positive rate and
    ///   capacity. The script returns before reading the clock or writing anything.
    /// - [`BucketGateError::StoreUnavailable`] when Redis cannot run the script.
    ///   This is neither an admit nor a deny.
    pub async fn acquire(
        &self,
        key: &RedisKey,
        defaults: &BucketDefaults,
        amount: u64,
    ) -> Result<RateLimitDecision, BucketGateError> {
        if amount == 0 {
            return Err(BucketGateError::InvalidAmount(amount));
        }

        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let (status, first, second, third): (String, String, String, String) = self
            .acquire_script
            .key(keys.tokens.as_str())
            .key(keys.timestamp.as_str())
            .key(keys.config.as_str())
            .arg(*defaults.rate)
            .arg(*defaults.capacity)
            .arg(amount)
            .arg(self.idle_ttl_ms)
            .invoke_async(&mut connection_manager)
            .await?;

        match status.as_str() {
            "admitted" => Ok(RateLimitDecision::Admitted {
                tokens_remaining: parse_number(&first)?,
            }),
            "denied" => Ok(RateLimitDecision::Denied {
                tokens_remaining: parse_number(&first)?,
                retry_after: parse_number(&second)?,
                retry_in: seconds_to_duration(parse_number(&third)?),
            }),
            "invalid_config" => {
                let err = invalid_config(first, second);
                tracing::warn!(key = &***key, %err, "bucketgate.acquire.invalid_config");
                Err(err)
            }
            _ => Err(BucketGateError::UnexpectedStoreReply(format!(
                "unknown acquire status {status:?}"
            ))),
        }
    } // end method acquire

    /// [`acquire`](Self::acquire) a single token.
    pub async fn acquire_one(
        &self,
        key: &RedisKey,
        defaults: &BucketDefaults,
    ) -> Result<RateLimitDecision, BucketGateError> {
        self.acquire(key, defaults, 1).await
    }

    /// Keep calling [`acquire`](Self::acquire) until admitted or `max_wait` runs out.
    ///
    /// Waits use `retry_in`, which is measured on the Redis clock, plus a random
    /// 10–100ms jitter so callers denied together spread out. If the next wait
    /// would overrun `max_wait` the last [`RateLimitDecision::Denied`] is
    /// returned. Store errors end the loop immediately.
    pub async fn acquire_with_retry(
        &self,
        key: &RedisKey,
        defaults: &BucketDefaults,
        amount: u64,
        max_wait: Duration,
    ) -> Result<RateLimitDecision, BucketGateError> {
        let started = Instant::now();

        loop {
            let decision = self.acquire(key, defaults, amount).await?;

            let RateLimitDecision::Denied { retry_in, .. } = decision else {
                return Ok(decision);
            };

            let pause = retry_in.saturating_add(retry_jitter());
            if started.elapsed().saturating_add(pause) > max_wait {
                return Ok(decision);
            }

            tracing::debug!(key = &***key, ?pause, "bucketgate.retry.sleep");
            runtime::sleep(pause).await;
        }
    } // end method acquire_with_retry

    /// Stored state of `key`, without refilling it.
    pub async fn state(&self, key: &RedisKey) -> Result<Option<BucketState>, BucketGateError> {
        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let (tokens, timestamp): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(keys.tokens.as_str())
            .arg(keys.timestamp.as_str())
            .query_async(&mut connection_manager)
            .await?;

        match (tokens, timestamp) {
            (Some(tokens), Some(timestamp)) => Ok(Some(BucketState {
                tokens_remaining: parse_number(&tokens)?,
                last_refill_time: parse_number(&timestamp)?,
            })),
            _ => Ok(None),
        }
    }

    /// Delete the bucket of `key`. The next call for it is a cold start.
    ///
    /// The override record is left alone.
    pub async fn reset(&self, key: &RedisKey) -> Result<(), BucketGateError> {
        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let _: () = redis::pipe()
            .atomic()
            .del(keys.tokens.as_str())
            .ignore()
            .del(keys.timestamp.as_str())
            .ignore()
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    }

    /// Replace the override record of `key`.
    ///
    /// Present fields are stored, absent ones are removed. An empty override
    /// deletes the record.
    pub async fn set_override(
        &self,
        key: &RedisKey,
        config_override: ConfigOverride,
    ) -> Result<(), BucketGateError> {
        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let mut fields: Vec<(&str, f64)> = Vec::with_capacity(2);
        if let Some(rate) = config_override.rate {
            fields.push(("rate", rate));
        }
        if let Some(capacity) = config_override.capacity {
            fields.push(("capacity", capacity));
        }

        let mut pipe = redis::pipe();
        pipe.atomic().del(keys.config.as_str()).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(keys.config.as_str(), fields.as_slice()).ignore();
        }

        let _: () = pipe.query_async(&mut connection_manager).await?;

        Ok(())
    }

    /// Override record of `key`, if any.
    pub async fn get_override(
        &self,
        key: &RedisKey,
    ) -> Result<Option<ConfigOverride>, BucketGateError> {
        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let (rate, capacity): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(keys.config.as_str())
            .arg("rate")
            .arg("capacity")
            .query_async(&mut connection_manager)
            .await?;

        let config_override = ConfigOverride {
            rate: rate.map(|value| parse_override("rate", value)).transpose()?,
            capacity: capacity
                .map(|value| parse_override("capacity", value))
                .transpose()?,
        };

        Ok((!config_override.is_empty()).then_some(config_override))
    }

    /// Delete the override record of `key`.
    pub async fn remove_override(&self, key: &RedisKey) -> Result<(), BucketGateError> {
        let keys = self.key_generator.get(key);
        let mut connection_manager = self.connection_manager.clone();

        let _: () = redis::cmd("DEL")
            .arg(keys.config.as_str())
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    }
}

fn parse_number(value: &str) -> Result<f64, BucketGateError> {
    value
        .parse()
        .map_err(|_| BucketGateError::UnexpectedStoreReply(format!("not a number: {value:?}")))
}

fn parse_override(field: &'static str, value: String) -> Result<f64, BucketGateError> {
    match value.trim().parse() {
        Ok(number) => Ok(number),
        Err(_) => Err(BucketGateError::InvalidOverride { field, value }),
    }
}

/// Defaults are validated before they reach Redis, so a value that does not
/// parse came from the override record.
fn invalid_config(rate: String, capacity: String) -> BucketGateError {
    let rate = match parse_override("rate", rate) {
        Ok(rate) => rate,
        Err(err) => return err,
    };
    let capacity = match parse_override("capacity", capacity) {
        Ok(capacity) => capacity,
        Err(err) => return err,
    };

    BucketGateError::InvalidConfig { rate, capacity }
}
