//! Rate limiter behaviour across windows

use mta_rs::config::RateLimitConfig;
use mta_rs::security::{RateLimitError, RateLimiter};
use std::net::IpAddr;
use std::time::Duration;

fn limiter(messages_per_ip: usize, window_secs: u64) -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        connections_per_ip: 3,
        connection_window_secs: window_secs,
        messages_per_ip,
        message_window_secs: window_secs,
        recipients_per_message: 5,
        monthly_quota: 1_000,
    })
}

fn recipients(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("user{}@example.com", i)).collect()
}

#[tokio::test]
async fn test_message_window_recovers() {
    let limiter = limiter(3, 1);
    let ip: IpAddr = "203.0.113.5".parse().unwrap();
    let to = recipients(1);

    for _ in 0..3 {
        limiter.check_message(ip, "news@brand.example", &to).await.unwrap();
    }
    assert!(matches!(
        limiter.check_message(ip, "news@brand.example", &to).await,
        Err(RateLimitError::TooManyMessages { max: 3, .. })
    ));

    // Other addresses have their own window
    let other: IpAddr = "203.0.113.6".parse().unwrap();
    assert!(limiter.check_message(other, "news@brand.example", &to).await.is_ok());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(limiter.check_message(ip, "news@brand.example", &to).await.is_ok());
}

#[tokio::test]
async fn test_connection_window_recovers() {
    let limiter = limiter(10, 1);
    let ip: IpAddr = "2001:db8::1".parse().unwrap();

    for _ in 0..3 {
        limiter.check_connection(ip).await.unwrap();
    }
    assert!(limiter.check_connection(ip).await.is_err());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    limiter.cleanup().await;
    assert!(limiter.check_connection(ip).await.is_ok());
}

#[tokio::test]
async fn test_recipient_cap_records_nothing() {
    let limiter = limiter(10, 60);
    let ip: IpAddr = "203.0.113.5".parse().unwrap();

    let result = limiter.check_message(ip, "news@brand.example", &recipients(6)).await;
    assert_eq!(result, Err(RateLimitError::TooManyRecipients { count: 6, max: 5 }));
    assert_eq!(limiter.get_quota_usage("news@brand.example").await, 0);

    limiter.check_message(ip, "news@brand.example", &recipients(5)).await.unwrap();
    assert_eq!(limiter.get_quota_usage("NEWS@brand.example").await, 1);
}

#[tokio::test]
async fn test_monthly_quota_per_sender() {
    let limiter = limiter(100, 60);
    let ip: IpAddr = "203.0.113.5".parse().unwrap();
    limiter.set_custom_quota("small@brand.example", 2).await;

    let to = recipients(1);
    limiter.check_message(ip, "small@brand.example", &to).await.unwrap();
    limiter.check_message(ip, "small@brand.example", &to).await.unwrap();
    assert!(matches!(
        limiter.check_message(ip, "small@brand.example", &to).await,
        Err(RateLimitError::QuotaExceeded { used: 2, quota: 2, .. })
    ));

    // Default quota still applies to everyone else
    assert!(limiter.check_message(ip, "big@brand.example", &to).await.is_ok());
}
