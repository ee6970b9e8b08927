//! Security module
//!
//! Provides authentication, rate limiting, and TLS functionality:
//! - [`auth`]: SMTP authentication mechanisms (LOGIN, PLAIN)
//! - [`rate_limit`]: Connection, message and quota limits
//! - [`tls`]: TLS/STARTTLS configuration and handling

pub mod auth;
pub mod rate_limit;
pub mod tls;

pub use auth::{AuthError, AuthMechanism, Authenticator, Credentials};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use tls::TlsConfig;
