
mod test_bucket_engine;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
mod test_redis_key;
