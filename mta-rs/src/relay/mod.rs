//! Outbound relay
//!
//! Accepted messages are delivered directly to each recipient domain's mail
//! exchangers; there is no queue and no smarthost.
//! - [`email`]: the outbound message and its RFC 822 rendering
//! - [`service`]: per-domain MX resolution, failover and retry
//! - [`mock`]: scripted transport for tests
//!
//! The wire side lives behind [`MxTransport`]; production uses
//! [`crate::smtp::client::SmtpClient`].

pub mod email;
pub mod mock;
pub mod service;

pub use email::Email;
pub use service::RelayService;

use crate::utils::dns::DnsError;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no mail servers found for {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    Dns(#[from] DnsError),

    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("{host} rejected {command}: {reply}")]
    Rejected {
        host: String,
        command: String,
        reply: String,
    },

    #[error("{0} accepted none of the recipients")]
    NoRecipientsAccepted(String),

    #[error("message has no deliverable recipients")]
    NoRecipients,

    #[error("relay failed for {}", describe_failures(.0))]
    Aggregate(Vec<DomainFailure>),
}

fn describe_failures(failures: &[DomainFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.domain, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Delivery of one message to one mail exchanger
#[async_trait]
pub trait MxTransport: Send + Sync {
    /// Send `data` to `host` for `recipients`, returning the recipients the
    /// host accepted
    async fn send(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError>;
}

/// A domain whose recipients were handed to one of its exchangers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub domain: String,
    pub host: String,
    pub accepted: Vec<String>,
}

/// A domain none of whose exchangers took the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFailure {
    pub domain: String,
    pub recipients: Vec<String>,
    pub error: RelayError,
}

/// Per-domain outcome of [`RelayService::relay_email`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: Vec<Delivery>,
    pub failed: Vec<DomainFailure>,
    /// Recipients without a usable domain; never attempted
    pub skipped: Vec<String>,
}

impl RelayReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.delivered.is_empty()
    }

    /// Recipients accepted by some exchanger, in delivery order
    pub fn accepted_recipients(&self) -> Vec<String> {
        self.delivered
            .iter()
            .flat_map(|d| d.accepted.iter().cloned())
            .collect()
    }

    /// Collapse into a single error when any domain failed
    pub fn into_result(self) -> Result<Vec<Delivery>, RelayError> {
        if !self.failed.is_empty() {
            return Err(RelayError::Aggregate(self.failed));
        }
        if self.delivered.is_empty() {
            return Err(RelayError::NoRecipients);
        }
        Ok(self.delivered)
    }
}
