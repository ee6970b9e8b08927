//! mta-rs: mail transfer core for an email marketing platform
//!
//! Customers submit campaigns over authenticated SMTP; the server checks
//! the sender, applies rate limits and delivers each message straight to
//! the recipients' mail exchangers.
//!
//! # Features
//!
//! - **SMTP Server**: Submission with AUTH PLAIN/LOGIN and STARTTLS (RFC 5321, RFC 4954)
//! - **SPF**: Sender policy evaluation with lookup limits and caching (RFC 7208)
//! - **Rate limiting**: Per-IP connection and message windows, monthly quotas
//! - **Relay**: Direct-to-MX delivery with preference ordering, retry and failover
//! - **Bookkeeping**: Sent mailboxes, delivery marks and bounce status through [`storage::Store`]
//!
//! # Example
//!
//! ```no_run
//! use mta_rs::config::Config;
//! use mta_rs::smtp::{SessionServices, SmtpClient, SmtpServer};
//! use mta_rs::storage::MemoryStore;
//! use mta_rs::utils::SystemResolver;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let transport = SmtpClient::new(config.server.effective_hostname(), config.relay.clone());
//!     let services = SessionServices::from_config(
//!         &config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(SystemResolver::new()),
//!         Arc::new(transport),
//!         None,
//!     );
//!
//!     SmtpServer::new(Arc::new(services)).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP server, session and outbound client
//! - [`authentication`]: SPF evaluation
//! - [`relay`]: Direct-to-MX delivery
//! - [`security`]: SMTP AUTH, rate limiting and TLS
//! - [`storage`]: Application store boundary
//! - [`utils`]: DNS and address helpers

pub mod authentication;
pub mod config;
pub mod error;
pub mod relay;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
