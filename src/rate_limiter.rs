//! Top-level entrypoint that wires store implementations.
//!
//! The in-process store is always available through [`RateLimiter::local`]; the
//! Redis store is exposed through [`RateLimiter::redis`] when one of the Redis
//! features is enabled.

use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{LocalTokenBucket, LocalTokenBucketOptions};

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
use crate::{RedisTokenBucket, RedisTokenBucketOptions};

/// Top-level configuration for [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimiterOptions {
    /// Options for the local store.
    pub local: LocalTokenBucketOptions,
    /// Options for the Redis store.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    pub redis: RedisTokenBucketOptions,
}

/// Shortest pause between two cleanup passes.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

struct CleanupLoop {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Rate limiter entrypoint.
///
/// Owns one store per backend and the optional background cleanup of idle local
/// buckets.
pub struct RateLimiter {
    local: LocalTokenBucket,
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    redis: RedisTokenBucket,
    cleanup_loop: Mutex<Option<CleanupLoop>>,
}

impl RateLimiter {
    /// Create a new [`RateLimiter`].
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            local: LocalTokenBucket::new(options.local),
            #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
            #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
            redis: RedisTokenBucket::new(options.redis),
            cleanup_loop: Mutex::new(None),
        }
    }

    /// Access the Redis store.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    pub fn redis(&self) -> &RedisTokenBucket {
        &self.redis
    }

    /// Access the local store.
    pub fn local(&self) -> &LocalTokenBucket {
        &self.local
    }

    /// Start a background thread that drops local buckets idle for longer than
    /// `stale_after`, checking every `interval`.
    ///
    /// The first pass runs right away. `interval` is raised to
    /// [`MIN_CLEANUP_INTERVAL`] if shorter. Calling this while a loop is running
    /// does nothing. The thread only holds a weak reference and exits once the
    /// limiter is dropped.
    ///
    /// Redis buckets are not swept; give them
    /// [`idle_ttl`](crate::RedisTokenBucketOptions::idle_ttl) instead.
    pub fn run_cleanup_loop_with_config(self: &Arc<Self>, stale_after: Duration, interval: Duration) {
        let mut cleanup_loop = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cleanup_loop.is_some() {
            return;
        }

        let interval = cleanup_interval(interval);
        let (stop, stopped) = mpsc::channel::<()>();
        let limiter: Weak<Self> = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("bucketgate-cleanup".to_string())
            .spawn(move || {
                loop {
                    match limiter.upgrade() {
                        Some(limiter) => limiter.local.cleanup(stale_after),
                        None => break,
                    }

                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match spawned {
            Ok(thread) => *cleanup_loop = Some(CleanupLoop { stop, thread }),
            Err(err) => tracing::error!(%err, "bucketgate.cleanup.spawn_failed"),
        }
    } // end method run_cleanup_loop_with_config

    /// Stop the cleanup loop, if one is running, and wait for its thread to exit.
    ///
    /// Safe to call repeatedly.
    pub fn stop_cleanup_loop(&self) {
        let cleanup_loop = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(CleanupLoop { stop, thread }) = cleanup_loop else {
            return;
        };

        let _ = stop.send(());
        if thread.join().is_err() {
            tracing::error!("bucketgate.cleanup.panicked");
        }
    }
}

pub(crate) fn cleanup_interval(interval: Duration) -> Duration {
    interval.max(MIN_CLEANUP_INTERVAL)
}
