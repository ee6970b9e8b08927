use crate::utils::email::extract_domain;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Longest run of UTF-8 bytes packed into one encoded word (60 base64 chars)
const ENCODED_WORD_CHUNK: usize = 45;

/// An outbound message as handed to the relay
///
/// The body is kept as the submitted octets; only line endings are touched
/// when rendering, so 8-bit and already transfer-encoded content passes
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: Vec<u8>,
    pub content_type: String,
    /// Extra headers written after the standard set, in order
    pub headers: Vec<(String, String)>,
}

impl Email {
    pub fn new(from: impl Into<String>, to: Vec<String>, subject: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// `<unix-nanos@domain-of-From>`
    pub fn message_id(&self, now: DateTime<Utc>) -> String {
        let domain = extract_domain(&self.from).unwrap_or_else(|_| "localhost".to_string());
        format!("<{}{:09}@{}>", now.timestamp(), now.timestamp_subsec_nanos(), domain)
    }

    /// Render the message with CRLF line endings
    ///
    /// Non-ASCII text in Subject and extra headers is written as RFC 2047
    /// encoded words so the header block stays 7-bit.
    pub fn to_rfc822(&self, now: DateTime<Utc>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 512);

        let mut header = |name: &str, value: &str| {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        };

        header("From", &sanitize(&self.from));
        header("To", &sanitize(&self.to.join(", ")));
        header("Subject", &encode_text(&sanitize(&self.subject)));
        header("Date", &now.to_rfc2822());
        header("MIME-Version", "1.0");
        header("Content-Type", &sanitize(&self.content_type));
        header("Message-ID", &self.message_id(now));
        for (name, value) in &self.headers {
            header(&sanitize(name), &encode_text(&sanitize(value)));
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&normalize_line_endings(&self.body));
        if !out.ends_with(b"\r\n") {
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Header values never carry line breaks
fn sanitize(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Encode `value` as folded `=?UTF-8?B?...?=` words unless it is plain ASCII
fn encode_text(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(&chunk)));
    }
    words.join("\r\n ")
}

/// Turn bare LF into CRLF, leaving every other byte as is
fn normalize_line_endings(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 32);
    let mut previous = 0u8;
    for &byte in body {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}
