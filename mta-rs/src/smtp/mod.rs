//! SMTP server and client implementation (RFC 5321)
//!
//! - [`server`]: listener accepting submissions
//! - [`session`]: per-connection state machine with AUTH and STARTTLS
//! - [`commands`]: SMTP command parsing
//! - [`client`]: outbound client used for direct-to-MX delivery
//! - [`bounce`]: delivery status notification scanning

pub mod bounce;
pub mod client;
pub mod commands;
pub mod server;
pub mod session;

pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::{SessionServices, SmtpReply, SmtpSession};
