//! Scripted resolver for tests
//!
//! Answers come from tables filled in with the builder methods. Names
//! without an entry answer [`DnsError::NotFound`]. Every lookup is counted,
//! and a name can be made to hang forever to exercise lookup deadlines.

use super::{DnsError, DnsResolver, MxRecord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

type Answers<T> = HashMap<String, Result<Vec<T>, DnsError>>;

#[derive(Default)]
pub struct MockResolver {
    txt: Answers<String>,
    mx: Answers<MxRecord>,
    ips: Answers<IpAddr>,
    hanging: HashSet<String>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_txt(mut self, name: &str, records: &[&str]) -> Self {
        let records = records.iter().map(|r| r.to_string()).collect();
        self.txt.insert(name.to_ascii_lowercase(), Ok(records));
        self
    }

    pub fn with_txt_error(mut self, name: &str, error: DnsError) -> Self {
        self.txt.insert(name.to_ascii_lowercase(), Err(error));
        self
    }

    pub fn with_mx(mut self, name: &str, records: &[(&str, u16)]) -> Self {
        let records = records
            .iter()
            .map(|(host, preference)| MxRecord::new(*host, *preference))
            .collect();
        self.mx.insert(name.to_ascii_lowercase(), Ok(records));
        self
    }

    pub fn with_mx_error(mut self, name: &str, error: DnsError) -> Self {
        self.mx.insert(name.to_ascii_lowercase(), Err(error));
        self
    }

    pub fn with_ips(mut self, name: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self.ips.insert(name.to_ascii_lowercase(), Ok(ips));
        self
    }

    /// Every lookup for `name` never completes
    pub fn hanging(mut self, name: &str) -> Self {
        self.hanging.insert(name.to_ascii_lowercase());
        self
    }

    /// Total lookups answered (or started, for hanging names)
    pub fn lookups(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer<T: Clone>(&self, table: &Answers<T>, kind: &str, name: &str) -> Result<Vec<T>, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = name.to_ascii_lowercase();
        debug!("mock {} lookup for {}", kind, key);

        if self.hanging.contains(&key) {
            std::future::pending::<()>().await;
        }

        table
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Err(DnsError::NotFound(key)))
    }
}

#[async_trait]
impl DnsResolver for MockResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.answer(&self.txt, "TXT", name).await
    }

    async fn mx_lookup(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.answer(&self.mx, "MX", name).await
    }

    async fn ip_lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.answer(&self.ips, "A/AAAA", name).await
    }
}
