use thiserror::Error;

/// Crate-wide error for I/O, configuration and protocol plumbing
///
/// Each service keeps its own error type (`RelayError`, `SpfError`, ...);
/// those map to SMTP replies in the session and never surface here.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, MailError>;
