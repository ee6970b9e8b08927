//! SMTP AUTH implementation
//!
//! This module provides authentication mechanisms for SMTP.
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)
//!
//! Both mechanisms are only encodings: the session decodes them into
//! [`Credentials`] and hands them to [`Authenticator::authenticate`], which is
//! the single verification path.
//!
//! # Verification
//! Credentials are first checked as an account master key. If that does not
//! succeed they are checked as a per-key (sub-key) credential. A store that
//! cannot answer is reported as [`AuthError::Temporary`] so the client can
//! retry, wrong credentials as [`AuthError::Invalid`].

use crate::storage::Store;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    Invalid,

    #[error("temporary authentication failure: {0}")]
    Temporary(String),

    #[error("malformed authentication data: {0}")]
    Malformed(String),
}

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Mechanisms advertised in EHLO
    pub const SUPPORTED: [AuthMechanism; 2] = [AuthMechanism::Login, AuthMechanism::Plain];

    /// Parse mechanism from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    /// Get mechanism name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Decoded SASL credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authorization identity; empty when the client did not send one
    pub authzid: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: String::new(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode PLAIN authentication data
    ///
    /// Format: `authzid\0username\0password` (base64 encoded)
    pub fn decode_plain(auth_data: &str) -> Result<Self, AuthError> {
        let decoded = BASE64
            .decode(auth_data.trim())
            .map_err(|e| AuthError::Malformed(format!("Invalid base64: {}", e)))?;

        let text = std::str::from_utf8(&decoded)
            .map_err(|e| AuthError::Malformed(format!("Invalid UTF-8: {}", e)))?;
        let parts: Vec<&str> = text.split('\0').collect();

        if parts.len() != 3 || parts[1].is_empty() {
            return Err(AuthError::Malformed("Invalid PLAIN auth format".to_string()));
        }

        Ok(Self {
            authzid: parts[0].to_string(),
            username: parts[1].to_string(),
            password: parts[2].to_string(),
        })
    }
}

/// Decode one LOGIN continuation (username or password)
pub fn decode_login_credential(credential: &str) -> Result<String, AuthError> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| AuthError::Malformed(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded).map_err(|e| AuthError::Malformed(format!("Invalid UTF-8: {}", e)))
}

/// Base64 of the LOGIN prompts, as sent after `334`
pub fn login_prompt(step: LoginStep) -> &'static str {
    match step {
        LoginStep::Username => "VXNlcm5hbWU6", // "Username:"
        LoginStep::Password => "UGFzc3dvcmQ6", // "Password:"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Username,
    Password,
}

/// SMTP authenticator backed by the application store
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn Store>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Verify credentials received through any mechanism
    ///
    /// Returns the authenticated identity. A PLAIN authorization identity is
    /// never trusted; the identity is always the verified username.
    pub async fn authenticate(
        &self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<String, AuthError> {
        debug!(
            "Authentication attempt for {} using {}",
            credentials.username,
            mechanism.as_str()
        );

        if credentials.username.is_empty() {
            return Err(AuthError::Malformed("empty username".to_string()));
        }

        let master = self
            .store
            .check_smtp_master_key_exists(&credentials.username, &credentials.password)
            .await;

        match master {
            Ok(true) => return Ok(self.identity(credentials)),
            Ok(false) => {}
            Err(ref e) => warn!("Master key check failed for {}: {}", credentials.username, e),
        }

        match self
            .store
            .check_smtp_key_exists(&credentials.username, &credentials.password)
            .await
        {
            Ok(true) => {
                info!("Authenticated {} with an SMTP key", credentials.username);
                Ok(self.identity(credentials))
            }
            Ok(false) => match master {
                Err(e) => Err(AuthError::Temporary(e.to_string())),
                Ok(_) => {
                    warn!("Authentication failed for {}", credentials.username);
                    Err(AuthError::Invalid)
                }
            },
            Err(e) => {
                warn!("SMTP key check failed for {}: {}", credentials.username, e);
                Err(AuthError::Temporary(e.to_string()))
            }
        }
    }

    fn identity(&self, credentials: &Credentials) -> String {
        if !credentials.authzid.is_empty() && credentials.authzid != credentials.username {
            debug!(
                "Ignoring authorization identity {} for {}",
                credentials.authzid, credentials.username
            );
        }
        credentials.username.clone()
    }
}
