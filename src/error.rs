/// Error type for this crate.
///
/// A [`RateLimitDecision::Denied`](crate::RateLimitDecision::Denied) is not an
/// error: only configuration problems and store failures are reported here, and
/// every variant except [`BucketGateError::StoreUnavailable`] is raised before any
/// bucket state is touched.
#[derive(Debug, thiserror::Error)]
pub enum BucketGateError {
    /// The resolved rate or capacity is not strictly positive.
    #[error("invalid bucket config: rate={rate}, capacity={capacity} (both must be > 0)")]
    InvalidConfig {
        /// Resolved tokens per second.
        rate: f64,
        /// Resolved burst size.
        capacity: f64,
    },

    /// An override field is present but is not a number.
    #[error("invalid override field `{field}`: {value:?}")]
    InvalidOverride {
        /// Name of the override field (`rate` or `capacity`).
        field: &'static str,
        /// Raw stored value.
        value: String,
    },

    /// The requested amount of tokens is zero.
    #[error("invalid amount: {0} (must be > 0)")]
    InvalidAmount(u64),

    /// A resource key or prefix failed validation.
    #[error("invalid redis key: {0}")]
    InvalidRedisKey(String),

    /// The shared store could not run the atomic procedure.
    ///
    /// Callers decide whether this means fail-open or fail-closed.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    /// The store replied with something this client cannot decode.
    #[error("unexpected store reply: {0}")]
    UnexpectedStoreReply(String),
}
