use std::{ops::Deref, sync::Arc};

use crate::BucketGateError;

/// A validated newtype for resource keys and key prefixes.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
/// - Must not contain `{` or `}` (they delimit the cluster hash tag)
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct RedisKey(Arc<str>);

impl RedisKey {
    /// The prefix used when none is configured.
    pub fn default_prefix() -> Self {
        Self(Arc::from("bucketgate"))
    }
}

impl Deref for RedisKey {
    type Target = Arc<str>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for RedisKey {
    type Error = BucketGateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(BucketGateError::InvalidRedisKey(
                "Redis key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(BucketGateError::InvalidRedisKey(
                "Redis key must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(BucketGateError::InvalidRedisKey(
                "Redis key must not contain colons".to_string(),
            ))
        } else if value.contains(['{', '}']) {
            Err(BucketGateError::InvalidRedisKey(
                "Redis key must not contain braces".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for RedisKey {
    type Error = BucketGateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// The three Redis keys that hold one resource's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketKeys {
    pub tokens: String,
    pub timestamp: String,
    pub config: String,
}

/// Builds `<prefix>:{<key>}:<suffix>` names.
///
/// The braces form a cluster hash tag, so all keys of one resource map to the
/// same slot and a single script may touch them. Names are built on every call
/// and nothing is kept per resource key.
#[derive(Debug)]
pub(crate) struct RedisKeyGenerator {
    pub prefix: RedisKey,
    pub tokens_key_suffix: &'static str,
    pub timestamp_key_suffix: &'static str,
    pub config_key_suffix: &'static str,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: RedisKey) -> Self {
        Self {
            prefix,
            tokens_key_suffix: "tokens",
            timestamp_key_suffix: "timestamp",
            config_key_suffix: "config",
        }
    }

    fn get_key_with_suffix(&self, key: &RedisKey, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", *self.prefix, **key, suffix)
    }

    pub(crate) fn get(&self, key: &RedisKey) -> BucketKeys {
        BucketKeys {
            tokens: self.get_key_with_suffix(key, self.tokens_key_suffix),
            timestamp: self.get_key_with_suffix(key, self.timestamp_key_suffix),
            config: self.get_key_with_suffix(key, self.config_key_suffix),
        }
    }
}
