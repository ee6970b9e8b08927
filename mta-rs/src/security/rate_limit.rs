//! Abuse control for the SMTP submission server
//!
//! Four independent controls, each checked against a sliding log of
//! timestamps rather than a token bucket:
//! - connections per IP per window
//! - messages per IP per window
//! - recipients per message (a single comparison, not windowed)
//! - monthly message quota per sender, overridable per sender
//!
//! A counting sliding log can admit up to twice the nominal rate across a
//! window boundary (N requests at the end of one window, N more right after).
//!
//! State grows with every distinct IP and sender seen. [`RateLimiter::cleanup`]
//! must be called periodically by the owner of the limiter; the server binary
//! runs it on a timer.
//!
//! # Example
//! ```no_run
//! use mta_rs::config::RateLimitConfig;
//! use mta_rs::security::rate_limit::RateLimiter;
//! use std::net::IpAddr;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! let ip: IpAddr = "192.0.2.1".parse()?;
//!
//! if limiter.check_connection(ip).await.is_ok() {
//!     println!("Connection allowed");
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::RateLimitConfig;
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("too many connections from {ip} (max {max} per {window:?})")]
    TooManyConnections { ip: IpAddr, max: usize, window: Duration },

    #[error("too many messages from {ip} (max {max} per {window:?})")]
    TooManyMessages { ip: IpAddr, max: usize, window: Duration },

    #[error("too many recipients: {count} (max {max})")]
    TooManyRecipients { count: usize, max: usize },

    #[error("monthly quota exceeded for {sender}: {used}/{quota}")]
    QuotaExceeded { sender: String, used: u64, quota: u64 },
}

/// Sliding log of request timestamps
#[derive(Debug, Default)]
struct SlidingLog {
    requests: Vec<Instant>,
}

impl SlidingLog {
    /// Drop entries older than `now - window`
    fn prune(&mut self, now: Instant, window: Duration) {
        if let Some(cutoff) = now.checked_sub(window) {
            self.requests.retain(|&t| t > cutoff);
        }
    }

    fn is_full(&self, max: usize) -> bool {
        self.requests.len() >= max
    }

    fn record(&mut self, now: Instant) {
        self.requests.push(now);
    }
}

/// Connection, message and quota limiter shared by all sessions
pub struct RateLimiter {
    config: RateLimitConfig,
    connections: Mutex<HashMap<IpAddr, SlidingLog>>,
    messages: Mutex<HashMap<IpAddr, SlidingLog>>,
    /// `sender:YYYY-MM` → messages accepted this month
    monthly_quotas: Mutex<HashMap<String, u64>>,
    /// sender → custom monthly quota
    quota_overrides: Mutex<HashMap<String, u64>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            monthly_quotas: Mutex::new(HashMap::new()),
            quota_overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new connection from `ip`
    pub async fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        let window = self.config.connection_window();
        let max = self.config.connections_per_ip;
        let now = Instant::now();

        let mut connections = self.connections.lock().await;
        let log = connections.entry(ip).or_default();
        log.prune(now, window);

        if log.is_full(max) {
            warn!("Rate limit exceeded for IP {}: {} connections per {:?}", ip, max, window);
            return Err(RateLimitError::TooManyConnections { ip, max, window });
        }

        log.record(now);
        Ok(())
    }

    /// Admit a message from `ip` sent by `from` to `to`
    ///
    /// The recipient cap is checked first and independently of any window
    /// state. Nothing is recorded unless every control passes.
    pub async fn check_message(&self, ip: IpAddr, from: &str, to: &[String]) -> Result<(), RateLimitError> {
        let max_recipients = self.config.recipients_per_message;
        if to.len() > max_recipients {
            warn!("Too many recipients from {}: {} (max {})", ip, to.len(), max_recipients);
            return Err(RateLimitError::TooManyRecipients {
                count: to.len(),
                max: max_recipients,
            });
        }

        let window = self.config.message_window();
        let max = self.config.messages_per_ip;
        let now = Instant::now();

        // Lock order: messages, then overrides, then quotas
        let mut messages = self.messages.lock().await;
        let log = messages.entry(ip).or_default();
        log.prune(now, window);

        if log.is_full(max) {
            warn!("Rate limit exceeded for IP {}: {} messages per {:?}", ip, max, window);
            return Err(RateLimitError::TooManyMessages { ip, max, window });
        }

        let sender = from.to_ascii_lowercase();
        let quota = self.quota_for(&sender).await;
        let mut quotas = self.monthly_quotas.lock().await;
        let used = quotas.entry(quota_key(&sender)).or_insert(0);

        if *used >= quota {
            warn!("Monthly quota exceeded for {}: {}/{}", sender, used, quota);
            return Err(RateLimitError::QuotaExceeded {
                sender,
                used: *used,
                quota,
            });
        }

        *used += 1;
        log.record(now);
        debug!("Message admitted for {} from {} ({} this month)", sender, ip, used);
        Ok(())
    }

    /// Override the default monthly quota for one sender
    pub async fn set_custom_quota(&self, sender: &str, quota: u64) {
        info!("Setting custom monthly quota for {}: {}", sender, quota);
        self.quota_overrides
            .lock()
            .await
            .insert(sender.to_ascii_lowercase(), quota);
    }

    /// Messages accepted for `sender` in the current month
    pub async fn get_quota_usage(&self, sender: &str) -> u64 {
        let key = quota_key(&sender.to_ascii_lowercase());
        self.monthly_quotas.lock().await.get(&key).copied().unwrap_or(0)
    }

    /// Prune stale IP logs and drop quota counters from previous months
    pub async fn cleanup(&self) {
        let now = Instant::now();

        let pruned_connections = prune_logs(&self.connections, now, self.config.connection_window()).await;
        let pruned_messages = prune_logs(&self.messages, now, self.config.message_window()).await;

        let suffix = format!(":{}", current_month());
        let mut quotas = self.monthly_quotas.lock().await;
        let before = quotas.len();
        quotas.retain(|key, _| key.ends_with(&suffix));
        let pruned_quotas = before - quotas.len();

        debug!(
            "Rate limiter cleanup: {} connection logs, {} message logs, {} quota keys removed",
            pruned_connections, pruned_messages, pruned_quotas
        );
    }

    async fn quota_for(&self, sender: &str) -> u64 {
        self.quota_overrides
            .lock()
            .await
            .get(sender)
            .copied()
            .unwrap_or(self.config.monthly_quota)
    }

    #[cfg(test)]
    async fn tracked_ips(&self) -> (usize, usize) {
        (self.connections.lock().await.len(), self.messages.lock().await.len())
    }
}

async fn prune_logs(logs: &Mutex<HashMap<IpAddr, SlidingLog>>, now: Instant, window: Duration) -> usize {
    let mut logs = logs.lock().await;
    let before = logs.len();
    logs.retain(|_, log| {
        log.prune(now, window);
        !log.requests.is_empty()
    });
    before - logs.len()
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

fn quota_key(sender: &str) -> String {
    format!("{}:{}", sender, current_month())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            connections_per_ip: 3,
            connection_window_secs: 60,
            messages_per_ip: 2,
            message_window_secs: 60,
            recipients_per_message: 5,
            monthly_quota: 100,
        }
    }

    fn recipients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user{}@example.com", i)).collect()
    }

    #[test]
    fn test_sliding_log_prune() {
        let mut log = SlidingLog::default();
        let now = Instant::now();
        log.record(now);
        log.prune(now + Duration::from_secs(61), Duration::from_secs(60));
        assert!(log.requests.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check_connection(ip).await.is_ok());
        }

        assert!(matches!(
            limiter.check_connection(ip).await,
            Err(RateLimitError::TooManyConnections { max: 3, .. })
        ));

        // Other IPs are unaffected
        let other: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(limiter.check_connection(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_message_limit_per_ip() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(limiter.check_message(ip, "a@brand.example", &recipients(1)).await.is_ok());
        assert!(limiter.check_message(ip, "b@brand.example", &recipients(1)).await.is_ok());
        assert!(matches!(
            limiter.check_message(ip, "c@brand.example", &recipients(1)).await,
            Err(RateLimitError::TooManyMessages { .. })
        ));
    }

    #[tokio::test]
    async fn test_recipient_cap_does_not_consume_window() {
        let limiter = RateLimiter::new(test_config());
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        assert_eq!(
            limiter.check_message(ip, "a@brand.example", &recipients(6)).await,
            Err(RateLimitError::TooManyRecipients { count: 6, max: 5 })
        );
        assert_eq!(limiter.get_quota_usage("a@brand.example").await, 0);

        // Both window slots are still available
        assert!(limiter.check_message(ip, "a@brand.example", &recipients(5)).await.is_ok());
        assert!(limiter.check_message(ip, "a@brand.example", &recipients(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_monthly_quota_and_override() {
        let mut config = test_config();
        config.messages_per_ip = 100;
        config.monthly_quota = 2;
        let limiter = RateLimiter::new(config);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(limiter.check_message(ip, "news@brand.example", &recipients(1)).await.is_ok());
        assert!(limiter.check_message(ip, "News@Brand.example", &recipients(1)).await.is_ok());
        assert_eq!(limiter.get_quota_usage("news@brand.example").await, 2);

        assert!(matches!(
            limiter.check_message(ip, "news@brand.example", &recipients(1)).await,
            Err(RateLimitError::QuotaExceeded { used: 2, quota: 2, .. })
        ));

        limiter.set_custom_quota("news@brand.example", 3).await;
        assert!(limiter.check_message(ip, "news@brand.example", &recipients(1)).await.is_ok());
        assert_eq!(limiter.get_quota_usage("news@brand.example").await, 3);
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_logs_and_old_months() {
        let mut config = test_config();
        config.connection_window_secs = 0;
        config.message_window_secs = 0;
        let limiter = RateLimiter::new(config);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        limiter.check_connection(ip).await.unwrap();
        limiter.check_message(ip, "a@brand.example", &recipients(1)).await.unwrap();
        limiter
            .monthly_quotas
            .lock()
            .await
            .insert("a@brand.example:1999-01".to_string(), 7);

        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.cleanup().await;

        assert_eq!(limiter.tracked_ips().await, (0, 0));
        let quotas = limiter.monthly_quotas.lock().await;
        assert!(!quotas.contains_key("a@brand.example:1999-01"));
        assert!(quotas.contains_key(&quota_key("a@brand.example")));
    }
}
