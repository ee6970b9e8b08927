//! Sender authentication for inbound mail
//!
//! Only SPF is evaluated, against the `MAIL FROM` domain and the client IP:
//! - [`spf`]: the validator and its cache
//! - [`types`]: results, qualifiers and parsed record terms

pub mod spf;
pub mod types;

pub use spf::{SpfError, SpfValidator};
pub use types::SpfResult;
