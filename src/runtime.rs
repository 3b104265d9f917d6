use std::time::Duration;

#[cfg(feature = "redis-tokio")]
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(all(feature = "redis-smol", not(feature = "redis-tokio")))]
pub(crate) async fn sleep(duration: Duration) {
    smol::Timer::after(duration).await;
}
