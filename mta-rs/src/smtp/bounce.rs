//! Delivery status notification scanning
//!
//! Bounce reports arrive as ordinary messages. Each per-recipient block of
//! a DSN (RFC 3464) names the recipient in `Final-Recipient` or
//! `Original-Recipient` and the failure in `Status` or `Diagnostic-Code`.
//! A `5.x.x`/`5xx` code is a hard bounce, `4.x.x`/`4xx` a soft one.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceType {
    Hard,
    Soft,
}

impl BounceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceType::Hard => "hard",
            BounceType::Soft => "soft",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code.trim().chars().next() {
            Some('5') => Some(BounceType::Hard),
            Some('4') => Some(BounceType::Soft),
            _ => None,
        }
    }
}

impl fmt::Display for BounceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounce {
    pub recipient: String,
    pub bounce_type: BounceType,
}

#[derive(Default)]
struct Block {
    final_recipient: Option<String>,
    original_recipient: Option<String>,
    bounce_type: Option<BounceType>,
}

impl Block {
    fn finish(&mut self, out: &mut Vec<Bounce>) {
        let block = std::mem::take(self);
        let recipient = block.final_recipient.or(block.original_recipient);
        if let (Some(recipient), Some(bounce_type)) = (recipient, block.bounce_type) {
            if !out.iter().any(|b| b.recipient == recipient) {
                out.push(Bounce {
                    recipient,
                    bounce_type,
                });
            }
        }
    }
}

/// Extract bounced recipients from a message body
pub fn scan(body: &str) -> Vec<Bounce> {
    let mut bounces = Vec::new();
    let mut block = Block::default();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            block.finish(&mut bounces);
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };

        match name.trim().to_ascii_lowercase().as_str() {
            "final-recipient" => block.final_recipient = address_of(value),
            "original-recipient" => block.original_recipient = address_of(value),
            // Status is the structured code and wins over the free-form diagnostic
            "status" => block.bounce_type = BounceType::from_code(value).or(block.bounce_type),
            "diagnostic-code" => {
                if block.bounce_type.is_none() {
                    block.bounce_type = diagnostic_type(value);
                }
            }
            _ => {}
        }
    }
    block.finish(&mut bounces);

    bounces
}

/// `rfc822; user@example.com` → `user@example.com`
fn address_of(value: &str) -> Option<String> {
    let address = match value.split_once(';') {
        Some((_, address)) => address,
        None => value,
    };
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    if address.contains('@') {
        Some(address.to_string())
    } else {
        None
    }
}

/// `smtp; 550 5.1.1 User unknown` → Hard
fn diagnostic_type(value: &str) -> Option<BounceType> {
    let text = match value.split_once(';') {
        Some((_, text)) => text,
        None => value,
    };
    text.split_whitespace().next().and_then(BounceType::from_code)
}
