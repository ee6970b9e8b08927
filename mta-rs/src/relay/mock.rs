//! Scripted transport for tests
//!
//! Hosts deliver successfully unless configured to fail. Every attempt is
//! recorded with its timestamp so retry spacing can be asserted.

use super::{MxTransport, RelayError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub host: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockTransport {
    failing: HashSet<String>,
    /// host → number of leading attempts that fail before it succeeds
    flaky: HashMap<String, usize>,
    /// recipients every host rejects at RCPT
    rejected: HashSet<String>,
    attempts: Mutex<Vec<Attempt>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt against `host` fails
    pub fn failing(mut self, host: &str) -> Self {
        self.failing.insert(host.to_string());
        self
    }

    /// The first `failures` attempts against `host` fail
    pub fn flaky(mut self, host: &str, failures: usize) -> Self {
        self.flaky.insert(host.to_string(), failures);
        self
    }

    pub fn rejecting(mut self, recipient: &str) -> Self {
        self.rejected.insert(recipient.to_string());
        self
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn attempts_for(&self, host: &str) -> Vec<Attempt> {
        self.attempts().into_iter().filter(|a| a.host == host).collect()
    }
}

#[async_trait]
impl MxTransport for MockTransport {
    async fn send(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError> {
        let previous = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| RelayError::Connection {
                    host: host.to_string(),
                    reason: "mock poisoned".to_string(),
                })?;
            let previous = attempts.iter().filter(|a| a.host == host).count();
            attempts.push(Attempt {
                host: host.to_string(),
                from: from.to_string(),
                recipients: recipients.to_vec(),
                data: data.to_vec(),
                at: Instant::now(),
            });
            previous
        };

        let flaky = self.flaky.get(host).map(|&n| previous < n).unwrap_or(false);
        if self.failing.contains(host) || flaky {
            return Err(RelayError::Connection {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let accepted: Vec<String> = recipients
            .iter()
            .filter(|r| !self.rejected.contains(*r))
            .cloned()
            .collect();
        if accepted.is_empty() {
            return Err(RelayError::NoRecipientsAccepted(host.to_string()));
        }
        Ok(accepted)
    }
}
