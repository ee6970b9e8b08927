//! Direct-to-MX delivery
//!
//! Recipients are grouped by domain and each domain is relayed on its own:
//! a failure for one domain never prevents delivery to the others.
//!
//! For each domain the MX records are tried in ascending preference. A
//! domain without MX records falls back to its own address record
//! (RFC 5321 §5.1). Each host gets up to `retry_attempts` tries, spaced by
//! `retry_delay × attempt`; the first host that accepts the message wins.

use super::{Delivery, DomainFailure, Email, MxTransport, RelayError, RelayReport};
use crate::config::RelayConfig;
use crate::utils::dns::{lookup_with_timeout, DnsResolver, MxRecord};
use crate::utils::email::extract_domain;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outbound relay shared by all sessions
pub struct RelayService {
    resolver: Arc<dyn DnsResolver>,
    transport: Arc<dyn MxTransport>,
    config: RelayConfig,
}

impl RelayService {
    pub fn new(resolver: Arc<dyn DnsResolver>, transport: Arc<dyn MxTransport>, config: RelayConfig) -> Self {
        Self {
            resolver,
            transport,
            config,
        }
    }

    /// Relay `email` to every recipient domain
    pub async fn relay_email(&self, email: &Email) -> RelayReport {
        let data = email.to_rfc822(Utc::now());
        let (domains, skipped) = group_by_domain(&email.to);

        for recipient in &skipped {
            warn!("Skipping recipient without a valid domain: {}", recipient);
        }

        let mut report = RelayReport {
            skipped,
            ..Default::default()
        };

        for (domain, recipients) in domains {
            match self
                .relay_to_domain(&domain, &email.from, &recipients, &data)
                .await
            {
                Ok(delivery) => report.delivered.push(delivery),
                Err(e) => {
                    error!("Relay to {} failed: {}", domain, e);
                    report.failed.push(DomainFailure {
                        domain,
                        recipients,
                        error: e,
                    });
                }
            }
        }

        info!(
            "Relayed message from {}: {} domain(s) delivered, {} failed, {} skipped",
            email.from,
            report.delivered.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// Deliver to one domain, failing over across its exchangers
    pub async fn relay_to_domain(
        &self,
        domain: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Delivery, RelayError> {
        let servers = self.resolve_mx(domain).await?;
        let mut last_error = RelayError::NoMailServers(domain.to_string());

        for mx in &servers {
            match self.send_with_retry(&mx.host, from, recipients, data).await {
                Ok(accepted) => {
                    info!("Delivered to {} via {} ({} recipient(s))", domain, mx.host, accepted.len());
                    return Ok(Delivery {
                        domain: domain.to_string(),
                        host: mx.host.clone(),
                        accepted,
                    });
                }
                Err(e) => {
                    warn!("Exchanger {} for {} failed: {}", mx.host, domain, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// MX records sorted by preference, or the domain itself when it has none
    pub async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, RelayError> {
        let timeout = self.config.dns_timeout();
        let records = lookup_with_timeout(domain, timeout, self.resolver.mx_lookup(domain)).await;

        let mut records = match records {
            Ok(records) if !records.is_empty() => records,
            Ok(_) => Vec::new(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if records.is_empty() {
            debug!("No MX records for {}, trying address records", domain);
            let addresses = lookup_with_timeout(domain, timeout, self.resolver.ip_lookup(domain)).await;
            match addresses {
                Ok(ips) if !ips.is_empty() => records.push(MxRecord::new(domain, 0)),
                Ok(_) => return Err(RelayError::NoMailServers(domain.to_string())),
                Err(e) if e.is_not_found() => return Err(RelayError::NoMailServers(domain.to_string())),
                Err(e) => return Err(e.into()),
            }
        }

        records.sort_by_key(|mx| mx.preference);
        Ok(records)
    }

    async fn send_with_retry(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Relay attempt {}/{} to {}", attempt, attempts, host);
            match self.transport.send(host, from, recipients, data).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.config.retry_delay() * attempt;
                    warn!("Attempt {} to {} failed ({}), retrying in {:?}", attempt, host, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Partition recipients by lowercased domain, keeping first-seen order
fn group_by_domain(recipients: &[String]) -> (Vec<(String, Vec<String>)>, Vec<String>) {
    let mut domains: Vec<(String, Vec<String>)> = Vec::new();
    let mut skipped = Vec::new();

    for recipient in recipients {
        let domain = match extract_domain(recipient) {
            Ok(domain) => domain,
            Err(_) => {
                skipped.push(recipient.clone());
                continue;
            }
        };

        match domains.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, list)) => list.push(recipient.clone()),
            None => domains.push((domain, vec![recipient.clone()])),
        }
    }

    (domains, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockTransport;
    use crate::utils::dns::mock::MockResolver;
    use crate::utils::dns::DnsError;
    use std::time::Duration;

    fn config(retry_attempts: u32, retry_delay_ms: u64) -> RelayConfig {
        RelayConfig {
            retry_attempts,
            retry_delay_ms,
            dns_timeout_ms: 200,
            ..RelayConfig::default()
        }
    }

    fn service(resolver: MockResolver, transport: MockTransport, config: RelayConfig) -> (RelayService, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        (RelayService::new(Arc::new(resolver), transport.clone(), config), transport)
    }

    fn email(to: &[&str]) -> Email {
        Email::new(
            "news@brand.example",
            to.iter().map(|s| s.to_string()).collect(),
            "Hello",
            "Body",
        )
    }

    #[test]
    fn test_group_by_domain() {
        let recipients: Vec<String> = ["a@One.example", "b@two.example", "c@one.example", "broken"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (domains, skipped) = group_by_domain(&recipients);

        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].0, "one.example");
        assert_eq!(domains[0].1, vec!["a@One.example", "c@one.example"]);
        assert_eq!(domains[1].0, "two.example");
        assert_eq!(skipped, vec!["broken"]);
    }

    #[tokio::test]
    async fn test_mx_sorted_by_preference() {
        let (relay, _) = service(
            MockResolver::new().with_mx("one.example", &[("mx2.one.example", 20), ("mx1.one.example", 10)]),
            MockTransport::new(),
            config(1, 1),
        );
        let records = relay.resolve_mx("one.example").await.unwrap();
        assert_eq!(records[0].host, "mx1.one.example");
        assert_eq!(records[1].host, "mx2.one.example");
    }

    #[tokio::test]
    async fn test_address_fallback_without_mx() {
        let (relay, _) = service(
            MockResolver::new().with_ips("bare.example", &["192.0.2.7"]),
            MockTransport::new(),
            config(1, 1),
        );
        assert_eq!(relay.resolve_mx("bare.example").await.unwrap(), vec![MxRecord::new("bare.example", 0)]);
        assert_eq!(
            relay.resolve_mx("nothing.example").await,
            Err(RelayError::NoMailServers("nothing.example".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dns_failure_is_reported() {
        let (relay, _) = service(
            MockResolver::new().with_mx_error(
                "one.example",
                DnsError::Failed {
                    name: "one.example".to_string(),
                    reason: "SERVFAIL".to_string(),
                },
            ),
            MockTransport::new(),
            config(1, 1),
        );
        assert!(matches!(relay.resolve_mx("one.example").await, Err(RelayError::Dns(_))));
    }

    #[tokio::test]
    async fn test_failover_to_next_exchanger() {
        let (relay, transport) = service(
            MockResolver::new().with_mx("one.example", &[("mx1.one.example", 10), ("mx2.one.example", 20)]),
            MockTransport::new().failing("mx1.one.example"),
            config(2, 1),
        );

        let report = relay.relay_email(&email(&["a@one.example"])).await;
        assert!(report.is_success());
        assert_eq!(report.delivered[0].host, "mx2.one.example");
        assert_eq!(transport.attempts_for("mx1.one.example").len(), 2);
        assert_eq!(transport.attempts_for("mx2.one.example").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_domain_does_not_block_others() {
        let (relay, transport) = service(
            MockResolver::new()
                .with_mx("one.example", &[("mx.one.example", 10)])
                .with_mx("two.example", &[("mx.two.example", 10)]),
            MockTransport::new().failing("mx.one.example"),
            config(1, 1),
        );

        let report = relay
            .relay_email(&email(&["a@one.example", "b@two.example", "c@two.example"]))
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].domain, "one.example");
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].accepted, vec!["b@two.example", "c@two.example"]);

        // One message per domain, not per recipient
        let two = transport.attempts_for("mx.two.example");
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].recipients.len(), 2);
        assert!(String::from_utf8_lossy(&two[0].data).contains("Subject: Hello\r\n"));

        assert!(matches!(report.into_result(), Err(RelayError::Aggregate(_))));
    }

    #[tokio::test]
    async fn test_dns_failure_does_not_block_others() {
        let (relay, transport) = service(
            MockResolver::new()
                .with_mx_error(
                    "broken.example",
                    DnsError::Failed {
                        name: "broken.example".to_string(),
                        reason: "SERVFAIL".to_string(),
                    },
                )
                .with_mx("two.example", &[("mx.two.example", 10)]),
            MockTransport::new(),
            config(1, 1),
        );

        let report = relay.relay_email(&email(&["a@broken.example", "b@two.example"])).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].domain, "broken.example");
        assert_eq!(report.failed[0].recipients, vec!["a@broken.example"]);
        assert!(matches!(report.failed[0].error, RelayError::Dns(_)));
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].accepted, vec!["b@two.example"]);
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(transport.attempts()[0].host, "mx.two.example");
    }

    #[tokio::test]
    async fn test_partial_acceptance_is_reported() {
        let (relay, _) = service(
            MockResolver::new().with_mx("one.example", &[("mx.one.example", 10)]),
            MockTransport::new().rejecting("gone@one.example"),
            config(1, 1),
        );

        let report = relay
            .relay_email(&email(&["gone@one.example", "here@one.example"]))
            .await;
        assert!(report.is_success());
        assert_eq!(report.delivered[0].accepted, vec!["here@one.example"]);
    }

    #[tokio::test]
    async fn test_retry_count_and_backoff() {
        let (relay, transport) = service(
            MockResolver::new().with_mx("one.example", &[("mx.one.example", 10)]),
            MockTransport::new().failing("mx.one.example"),
            config(3, 20),
        );

        let result = relay
            .relay_to_domain("one.example", "news@brand.example", &["a@one.example".to_string()], b"x")
            .await;
        assert!(matches!(result, Err(RelayError::Connection { .. })));

        let attempts = transport.attempts_for("mx.one.example");
        assert_eq!(attempts.len(), 3);

        let first_gap = attempts[1].at - attempts[0].at;
        let second_gap = attempts[2].at - attempts[1].at;
        assert!(first_gap >= Duration::from_millis(20));
        assert!(second_gap >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let (relay, transport) = service(
            MockResolver::new().with_mx("one.example", &[("mx.one.example", 10)]),
            MockTransport::new().flaky("mx.one.example", 1),
            config(3, 1),
        );

        let report = relay.relay_email(&email(&["a@one.example"])).await;
        assert!(report.is_success());
        assert_eq!(transport.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_hung_resolver_fails_domain() {
        let (relay, transport) = service(MockResolver::new().hanging("slow.example"), MockTransport::new(), config(1, 1));

        let report = tokio::time::timeout(Duration::from_secs(5), relay.relay_email(&email(&["a@slow.example"])))
            .await
            .expect("relay must not hang");
        assert!(matches!(
            report.failed[0].error,
            RelayError::Dns(DnsError::Timeout(_))
        ));
        assert!(transport.attempts().is_empty());
    }
}
