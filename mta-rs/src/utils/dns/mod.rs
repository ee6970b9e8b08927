//! DNS utilities for mail server operations
//!
//! This module provides the resolver seam shared by SPF evaluation and
//! outbound relay:
//! - [`DnsResolver`]: TXT, MX and A/AAAA lookups behind a trait
//! - [`SystemResolver`]: the production implementation over trust-dns
//! - [`lookup_with_timeout`]: deadline wrapper used by every caller
//! - [`mock`]: scripted resolver for tests
//!
//! # Examples
//! ```no_run
//! use mta_rs::utils::dns::{DnsResolver, SystemResolver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = SystemResolver::new();
//! let servers = resolver.mx_lookup("gmail.com").await?;
//! println!("Mail servers: {:?}", servers);
//! # Ok(())
//! # }
//! ```

pub mod mock;

use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN or an empty answer
    #[error("no records found for {0}")]
    NotFound(String),

    #[error("lookup for {0} timed out")]
    Timeout(String),

    #[error("lookup for {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

impl DnsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DnsError::NotFound(_))
    }
}

/// A mail exchanger for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
}

impl MxRecord {
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
        }
    }
}

/// DNS lookups needed by the mail transfer core
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// TXT records, each returned as its character-strings concatenated
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// MX records in the order the server returned them
    async fn mx_lookup(&self, name: &str) -> Result<Vec<MxRecord>, DnsError>;

    /// A and AAAA records
    async fn ip_lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Run a lookup under a deadline, turning an elapsed timer into [`DnsError::Timeout`]
pub async fn lookup_with_timeout<T, F>(name: &str, deadline: Duration, lookup: F) -> Result<T, DnsError>
where
    F: Future<Output = Result<T, DnsError>>,
{
    match tokio::time::timeout(deadline, lookup).await {
        Ok(result) => result,
        Err(_) => {
            warn!("DNS lookup for {} timed out after {:?}", name, deadline);
            Err(DnsError::Timeout(name.to_string()))
        }
    }
}

/// Resolver backed by the system configuration (falls back to trust-dns defaults)
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("Failed to load system DNS config ({}), using default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        Self { resolver }
    }

    fn map_error(name: &str, error: ResolveError) -> DnsError {
        match error.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound(name.to_string()),
            ResolveErrorKind::Timeout => DnsError::Timeout(name.to_string()),
            _ => DnsError::Failed {
                name: name.to_string(),
                reason: error.to_string(),
            },
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, DnsError> {
        debug!("TXT lookup for {}", name);
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part))
                    .collect::<String>()
            })
            .collect())
    }

    async fn mx_lookup(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        debug!("MX lookup for {}", name);
        let lookup = self
            .resolver
            .mx_lookup(name)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        Ok(lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                MxRecord::new(host.trim_end_matches('.'), mx.preference())
            })
            .collect())
    }

    async fn ip_lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        debug!("A/AAAA lookup for {}", name);
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| Self::map_error(name, e))?;

        Ok(lookup.iter().collect())
    }
}
