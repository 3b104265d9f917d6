#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod rate_limiter;
pub use rate_limiter::*;

mod bucket;
pub use bucket::resolve_config;

mod clock;
pub use clock::*;

pub mod local;
pub use self::local::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub mod redis;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub use self::redis::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
mod runtime;

mod error;
pub use error::*;

mod common;
pub use common::{
    BucketDefaults, BucketState, Capacity, ConfigOverride, EffectiveConfig, Rate,
    RateLimitDecision,
};

#[cfg(test)]
mod tests;
