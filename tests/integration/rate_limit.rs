use std::time::Duration;

use chat_archiver::rate_limit::RateLimiter;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_under_limit_is_immediate() {
    let limiter = RateLimiter::new(3, Duration::from_secs(1));
    let before = Instant::now();
    limiter.acquire().await;
    limiter.acquire().await;
    limiter.acquire().await;
    assert_eq!(Instant::now(), before);
    assert_eq!(limiter.in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_full_window_suspends_until_oldest_expires() {
    let limiter = RateLimiter::new(2, Duration::from_millis(500));
    let start = Instant::now();
    limiter.acquire().await;
    limiter.acquire().await;

    // Third permit has to wait out the oldest one.
    limiter.acquire().await;
    let waited = Instant::now() - start;
    assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_permits_expire_without_release() {
    let limiter = RateLimiter::new(1, Duration::from_millis(100));
    limiter.acquire().await;
    assert_eq!(limiter.in_flight(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(limiter.in_flight(), 0);

    let before = Instant::now();
    limiter.acquire().await;
    assert_eq!(Instant::now(), before);
}
