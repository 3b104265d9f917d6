//! In-process shared store.
//!
//! The local store keeps bucket and override state inside the current process using
//! [`DashMap`](dashmap::DashMap). Every thread holding a reference shares the same
//! buckets and the same [`Clock`](crate::Clock), which makes it the authoritative
//! store for callers living in one process.
//!
//! # When to Use
//!
//! ✅ **Use the local store when:**
//! - All callers run inside one process
//! - Latency matters more than cross-host coordination
//! - Tests need a deterministic clock
//!
//! ❌ **Use the Redis store instead when:**
//! - Callers run on several hosts or pods
//! - Limits must hold for the fleet as a whole
//!
//! # Examples
//!
//! ```
//! use bucketgate::{BucketDefaults, Capacity, LocalTokenBucket, LocalTokenBucketOptions, Rate, RateLimitDecision};
//!
//! let buckets = LocalTokenBucket::new(LocalTokenBucketOptions::default());
//! let defaults = BucketDefaults::new(Rate::try_from(1.0).unwrap(), Capacity::try_from(2.0).unwrap());
//!
//! assert!(buckets.acquire_one("origin", &defaults).unwrap().is_admitted());
//! assert!(buckets.acquire_one("origin", &defaults).unwrap().is_admitted());
//! assert!(matches!(
//!     buckets.acquire_one("origin", &defaults).unwrap(),
//!     RateLimitDecision::Denied { .. }
//! ));
//! ```

mod local_token_bucket;
pub use local_token_bucket::*;
