//! SPF (Sender Policy Framework) evaluation
//!
//! A deliberately partial RFC 7208 evaluator for inbound MAIL FROM checks.
//!
//! Supported mechanisms: `all`, `ip4`, `ip6`, `a`, `mx`. The `include`,
//! `redirect`, `exists` and `ptr` terms never match; they are skipped
//! silently, so a record like `v=spf1 include:_spf.example.net -all` fails
//! every client. A domain without an SPF record evaluates to `Neutral`.
//!
//! Every `a` lookup, the `mx` lookup and each MX host's address lookup
//! consume one unit of a per-call budget (`max_lookups`, 10 by default);
//! exhausting it is a `PermError`. Each DNS query is bounded by
//! `dns_timeout` and a query that does not answer in time is a `TempError`.
//!
//! Results are cached per `(domain, ip)` for `cache_duration`. Expired
//! entries are ignored and overwritten, never swept.
//!
//! # Example
//! ```no_run
//! use mta_rs::authentication::{SpfResult, SpfValidator};
//! use mta_rs::config::SpfConfig;
//! use mta_rs::utils::dns::SystemResolver;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let validator = SpfValidator::new(Arc::new(SystemResolver::new()), SpfConfig::default());
//! let result = validator
//!     .check_host("203.0.113.5".parse()?, "example.com", "news@example.com")
//!     .await
//!     .unwrap_or_else(|e| e.result());
//!
//! if result == SpfResult::Fail {
//!     println!("reject");
//! }
//! # Ok(())
//! # }
//! ```

use super::types::{normalize, Mechanism, SpfResult, SpfTerm};
use crate::config::SpfConfig;
use crate::utils::dns::{lookup_with_timeout, DnsError, DnsResolver};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpfError {
    #[error("temporary DNS error: {0}")]
    Temporary(String),

    #[error("invalid SPF record: {0}")]
    Permanent(String),

    #[error("DNS lookup limit of {0} exceeded")]
    LookupLimit(usize),
}

impl SpfError {
    pub fn result(&self) -> SpfResult {
        match self {
            SpfError::Temporary(_) => SpfResult::TempError,
            SpfError::Permanent(_) | SpfError::LookupLimit(_) => SpfResult::PermError,
        }
    }
}

impl From<DnsError> for SpfError {
    fn from(error: DnsError) -> Self {
        SpfError::Temporary(error.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    result: SpfResult,
    stored_at: Instant,
}

/// SPF validator for incoming mail, shared by all sessions
pub struct SpfValidator {
    resolver: Arc<dyn DnsResolver>,
    config: SpfConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

/// State of a single `check_host` call
struct Evaluation<'a> {
    validator: &'a SpfValidator,
    ip: IpAddr,
    domain: &'a str,
    lookups: usize,
}

impl SpfValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>, config: SpfConfig) -> Self {
        Self {
            resolver,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate the SPF policy of `domain` for a client at `ip`
    ///
    /// `sender` is the full MAIL FROM address and is only used for logging.
    pub async fn check_host(&self, ip: IpAddr, domain: &str, sender: &str) -> Result<SpfResult, SpfError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return Err(SpfError::Permanent(format!("no domain in sender {:?}", sender)));
        }

        let key = format!("{}:{}", domain, ip);
        if let Some(result) = self.cached(&key).await {
            debug!("SPF cache hit for {}: {}", key, result);
            return Ok(result);
        }

        info!("Checking SPF for {} from {} (domain {})", sender, ip, domain);

        let record = match self.lookup_record(&domain).await? {
            Some(record) => record,
            None => {
                debug!("No SPF record found for domain: {}", domain);
                self.store(key, SpfResult::Neutral).await;
                return Ok(SpfResult::Neutral);
            }
        };

        debug!("Found SPF record for {}: {}", domain, record);

        let mut evaluation = Evaluation {
            validator: self,
            ip: normalize(ip),
            domain: &domain,
            lookups: 0,
        };
        let result = evaluation.evaluate(&record).await?;

        info!("SPF result for {} from {}: {}", sender, ip, result);
        self.store(key, result).await;
        Ok(result)
    }

    async fn cached(&self, key: &str) -> Option<SpfResult> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.config.cache_duration())
            .map(|entry| entry.result)
    }

    async fn store(&self, key: String, result: SpfResult) {
        let entry = CacheEntry {
            result,
            stored_at: Instant::now(),
        };
        self.cache.write().await.insert(key, entry);
    }

    /// First TXT record starting with `v=spf1`; `None` when the domain has none
    async fn lookup_record(&self, domain: &str) -> Result<Option<String>, SpfError> {
        let records = lookup_with_timeout(
            domain,
            self.config.dns_timeout(),
            self.resolver.txt_lookup(domain),
        )
        .await;

        let records = match records {
            Ok(records) => records,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                warn!("SPF TXT lookup failed for {}: {}", domain, e);
                return Err(e.into());
            }
        };

        Ok(records.into_iter().find(|txt| is_spf_record(txt)))
    }
}

fn is_spf_record(txt: &str) -> bool {
    let mut words = txt.split_whitespace();
    words
        .next()
        .map(|version| version.eq_ignore_ascii_case("v=spf1"))
        .unwrap_or(false)
}

impl Evaluation<'_> {
    async fn evaluate(&mut self, record: &str) -> Result<SpfResult, SpfError> {
        for raw in record.split_whitespace().skip(1) {
            let term = SpfTerm::parse(raw).map_err(SpfError::Permanent)?;

            if self.matches(&term).await? {
                debug!("SPF term {} matched for {}", raw, self.ip);
                return Ok(term.qualifier.result());
            }
        }

        // No mechanism matched
        Ok(SpfResult::Neutral)
    }

    async fn matches(&mut self, term: &SpfTerm) -> Result<bool, SpfError> {
        match &term.mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4(..) | Mechanism::Ip6(..) => Ok(term.network_contains(self.ip)),
            Mechanism::A(target) => {
                let host = target.clone().unwrap_or_else(|| self.domain.to_string());
                let addresses = self.resolve_addresses(&host).await?;
                Ok(addresses.contains(&self.ip))
            }
            Mechanism::Mx(target) => {
                let name = target.clone().unwrap_or_else(|| self.domain.to_string());
                self.consume_lookup()?;
                let exchangers = self.query(&name, self.validator.resolver.mx_lookup(&name)).await?;

                for mx in exchangers {
                    if self.resolve_addresses(&mx.host).await?.contains(&self.ip) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Unsupported(name) => {
                debug!("Skipping unsupported SPF term {} for {}", name, self.domain);
                Ok(false)
            }
        }
    }

    async fn resolve_addresses(&mut self, host: &str) -> Result<Vec<IpAddr>, SpfError> {
        self.consume_lookup()?;
        let addresses = self.query(host, self.validator.resolver.ip_lookup(host)).await?;
        Ok(addresses.into_iter().map(normalize).collect())
    }

    /// Run one DNS query; a missing name is an empty answer, not an error
    async fn query<T, F>(&self, name: &str, lookup: F) -> Result<Vec<T>, SpfError>
    where
        F: std::future::Future<Output = Result<Vec<T>, DnsError>>,
    {
        match lookup_with_timeout(name, self.validator.config.dns_timeout(), lookup).await {
            Ok(answers) => Ok(answers),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => {
                warn!("SPF lookup for {} failed: {}", name, e);
                Err(e.into())
            }
        }
    }

    fn consume_lookup(&mut self) -> Result<(), SpfError> {
        self.lookups += 1;
        if self.lookups > self.validator.config.max_lookups {
            warn!(
                "SPF evaluation for {} exceeded {} DNS lookups",
                self.domain, self.validator.config.max_lookups
            );
            return Err(SpfError::LookupLimit(self.validator.config.max_lookups));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::dns::mock::MockResolver;
    use std::time::Duration;

    fn config() -> SpfConfig {
        SpfConfig {
            max_lookups: 10,
            cache_duration_secs: 300,
            dns_timeout_ms: 200,
        }
    }

    fn validator(resolver: MockResolver) -> (SpfValidator, Arc<MockResolver>) {
        let resolver = Arc::new(resolver);
        (SpfValidator::new(resolver.clone(), config()), resolver)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_ip4_pass_and_fail() {
        let (spf, _) = validator(
            MockResolver::new().with_txt("brand.example", &["v=spf1 ip4:203.0.113.0/24 -all"]),
        );

        let pass = spf.check_host(ip("203.0.113.5"), "brand.example", "news@brand.example").await;
        assert_eq!(pass, Ok(SpfResult::Pass));

        let fail = spf.check_host(ip("198.51.100.1"), "brand.example", "news@brand.example").await;
        assert_eq!(fail, Ok(SpfResult::Fail));
    }

    #[tokio::test]
    async fn test_no_record_is_neutral() {
        let (spf, _) = validator(
            MockResolver::new().with_txt("brand.example", &["google-site-verification=abc"]),
        );
        assert_eq!(
            spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await,
            Ok(SpfResult::Neutral)
        );
        assert_eq!(
            spf.check_host(ip("198.51.100.1"), "nxdomain.example", "a@nxdomain.example").await,
            Ok(SpfResult::Neutral)
        );
    }

    #[tokio::test]
    async fn test_qualifiers() {
        let (spf, _) = validator(
            MockResolver::new()
                .with_txt("soft.example", &["v=spf1 ~all"])
                .with_txt("neutral.example", &["v=spf1 ?all"])
                .with_txt("empty.example", &["v=spf1"]),
        );
        let client = ip("198.51.100.1");
        assert_eq!(spf.check_host(client, "soft.example", "a@soft.example").await, Ok(SpfResult::SoftFail));
        assert_eq!(
            spf.check_host(client, "neutral.example", "a@neutral.example").await,
            Ok(SpfResult::Neutral)
        );
        assert_eq!(spf.check_host(client, "empty.example", "a@empty.example").await, Ok(SpfResult::Neutral));
    }

    #[tokio::test]
    async fn test_a_and_mx_mechanisms() {
        let (spf, _) = validator(
            MockResolver::new()
                .with_txt("brand.example", &["v=spf1 a mx:relay.example -all"])
                .with_ips("brand.example", &["192.0.2.10"])
                .with_mx("relay.example", &[("mx1.relay.example", 10), ("mx2.relay.example", 20)])
                .with_ips("mx1.relay.example", &["192.0.2.20"])
                .with_ips("mx2.relay.example", &["2001:db8::25"]),
        );

        assert_eq!(spf.check_host(ip("192.0.2.10"), "brand.example", "a@brand.example").await, Ok(SpfResult::Pass));
        assert_eq!(spf.check_host(ip("2001:db8::25"), "brand.example", "a@brand.example").await, Ok(SpfResult::Pass));
        assert_eq!(spf.check_host(ip("192.0.2.99"), "brand.example", "a@brand.example").await, Ok(SpfResult::Fail));
    }

    #[tokio::test]
    async fn test_unsupported_terms_never_match() {
        let (spf, _) = validator(MockResolver::new().with_txt(
            "brand.example",
            &["v=spf1 include:_spf.google.com exists:%{i}.example ptr -all"],
        ));
        assert_eq!(
            spf.check_host(ip("209.85.220.41"), "brand.example", "a@brand.example").await,
            Ok(SpfResult::Fail)
        );
    }

    #[tokio::test]
    async fn test_malformed_network_is_permerror() {
        let (spf, _) = validator(MockResolver::new().with_txt("brand.example", &["v=spf1 ip4:300.1.1.1 -all"]));
        let result = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        assert!(matches!(result, Err(SpfError::Permanent(_))));
        assert_eq!(result.unwrap_err().result(), SpfResult::PermError);
    }

    #[tokio::test]
    async fn test_lookup_limit() {
        let record = format!("v=spf1 {} -all", vec!["a"; 11].join(" "));
        let (spf, _) = validator(
            MockResolver::new()
                .with_txt("brand.example", &[record.as_str()])
                .with_ips("brand.example", &["192.0.2.10"]),
        );

        let result = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        assert_eq!(result, Err(SpfError::LookupLimit(10)));
        assert_eq!(result.unwrap_err().result(), SpfResult::PermError);
    }

    #[tokio::test]
    async fn test_dns_failure_is_temperror_and_not_cached() {
        let (spf, resolver) = validator(MockResolver::new().with_txt_error(
            "brand.example",
            DnsError::Failed {
                name: "brand.example".to_string(),
                reason: "SERVFAIL".to_string(),
            },
        ));

        let first = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        assert_eq!(first.unwrap_err().result(), SpfResult::TempError);
        let _ = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_dns() {
        let (spf, resolver) = validator(
            MockResolver::new().with_txt("brand.example", &["v=spf1 ip4:203.0.113.0/24 -all"]),
        );

        let first = spf.check_host(ip("203.0.113.5"), "brand.example", "a@brand.example").await;
        let second = spf.check_host(ip("203.0.113.5"), "Brand.Example", "b@brand.example").await;
        assert_eq!(first, second);
        assert_eq!(resolver.lookups(), 1);

        // A different client IP is a different cache key
        let _ = spf.check_host(ip("203.0.113.6"), "brand.example", "a@brand.example").await;
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_entry_is_ignored() {
        let resolver = Arc::new(MockResolver::new().with_txt("brand.example", &["v=spf1 -all"]));
        let mut config = config();
        config.cache_duration_secs = 0;
        let spf = SpfValidator::new(resolver.clone(), config);

        let _ = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = spf.check_host(ip("198.51.100.1"), "brand.example", "a@brand.example").await;
        assert_eq!(resolver.lookups(), 2);
    }

    #[tokio::test]
    async fn test_hung_resolver_times_out() {
        let (spf, _) = validator(MockResolver::new().hanging("slow.example"));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            spf.check_host(ip("198.51.100.1"), "slow.example", "a@slow.example"),
        )
        .await
        .expect("check_host must not hang");
        assert_eq!(result.unwrap_err().result(), SpfResult::TempError);
    }
}
