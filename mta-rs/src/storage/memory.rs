use super::{Store, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A message recorded through [`Store::create_email_box`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMailbox {
    pub username: String,
    pub mailbox: String,
    pub from: String,
    pub to: Vec<String>,
}

/// In-memory store used by the development server and the test suite
#[derive(Default)]
pub struct MemoryStore {
    master_keys: RwLock<HashMap<String, String>>,
    smtp_keys: RwLock<HashMap<String, String>>,
    mailboxes: RwLock<Vec<StoredMailbox>>,
    delivered: RwLock<Vec<String>>,
    bounces: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_master_key(&self, login: &str, password: &str) {
        info!("Adding SMTP master key for {}", login);
        self.master_keys
            .write()
            .await
            .insert(login.to_string(), password.to_string());
    }

    pub async fn add_smtp_key(&self, key_name: &str, password: &str) {
        info!("Adding SMTP key {}", key_name);
        self.smtp_keys
            .write()
            .await
            .insert(key_name.to_string(), password.to_string());
    }

    pub async fn mailboxes(&self) -> Vec<StoredMailbox> {
        self.mailboxes.read().await.clone()
    }

    pub async fn delivered(&self) -> Vec<String> {
        self.delivered.read().await.clone()
    }

    pub async fn bounce_status(&self, recipient: &str) -> Option<String> {
        self.bounces.read().await.get(recipient).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn check_smtp_master_key_exists(&self, login: &str, password: &str) -> Result<bool, StoreError> {
        let keys = self.master_keys.read().await;
        Ok(keys.get(login).map(|p| p == password).unwrap_or(false))
    }

    async fn check_smtp_key_exists(&self, key_name: &str, password: &str) -> Result<bool, StoreError> {
        let keys = self.smtp_keys.read().await;
        Ok(keys.get(key_name).map(|p| p == password).unwrap_or(false))
    }

    async fn create_email_box(
        &self,
        username: &str,
        mailbox: &str,
        from: &str,
        to: &[String],
    ) -> Result<(), StoreError> {
        debug!("Recording message from {} in {}/{}", from, username, mailbox);
        self.mailboxes.write().await.push(StoredMailbox {
            username: username.to_string(),
            mailbox: mailbox.to_string(),
            from: from.to_string(),
            to: to.to_vec(),
        });
        Ok(())
    }

    async fn mark_email_as_delivered(&self, recipient: &str) -> Result<(), StoreError> {
        self.delivered.write().await.push(recipient.to_string());
        Ok(())
    }

    async fn update_bounce_status(&self, recipient: &str, bounce_type: &str) -> Result<(), StoreError> {
        self.bounces
            .write()
            .await
            .insert(recipient.to_string(), bounce_type.to_string());
        Ok(())
    }
}
