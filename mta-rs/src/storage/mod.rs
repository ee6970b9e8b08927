//! Persistence boundary
//!
//! The relational store (users, SMTP keys, mailboxes, delivery and bounce
//! bookkeeping) lives outside this crate. The mail transfer core only talks
//! to it through the [`Store`] trait:
//! - [`memory`]: in-process implementation for development and tests

pub mod memory;

pub use memory::{MemoryStore, StoredMailbox};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached; callers may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected operation: {0}")]
    Rejected(String),
}

/// Operations the mail transfer core needs from the application store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Account-level SMTP credential check
    async fn check_smtp_master_key_exists(&self, login: &str, password: &str) -> Result<bool, StoreError>;

    /// Per-key (sub-key) SMTP credential check
    async fn check_smtp_key_exists(&self, key_name: &str, password: &str) -> Result<bool, StoreError>;

    /// Persist an accepted message for later retrieval
    async fn create_email_box(
        &self,
        username: &str,
        mailbox: &str,
        from: &str,
        to: &[String],
    ) -> Result<(), StoreError>;

    async fn mark_email_as_delivered(&self, recipient: &str) -> Result<(), StoreError>;

    /// `bounce_type` is `"hard"` or `"soft"`
    async fn update_bounce_status(&self, recipient: &str, bounce_type: &str) -> Result<(), StoreError>;
}
