//! Utility modules
//!
//! - [`dns`]: DNS resolver seam and lookup deadlines
//! - [`email`]: Email address validation (RFC 5321)

pub mod dns;
pub mod email;

pub use dns::{DnsError, DnsResolver, MxRecord, SystemResolver};
pub use email::{extract_domain, local_part, validate_email};
