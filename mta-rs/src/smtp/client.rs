//! SMTP client for direct-to-MX delivery
//!
//! This module handles outgoing SMTP connections to recipient mail servers.
//!
//! # Features
//! - Port fallback (587, 465, 25 by default)
//! - Implicit TLS on port 465, opportunistic STARTTLS elsewhere
//! - EHLO with HELO fallback
//! - Partial recipient acceptance
//! - Connect and per-command timeouts
//!
//! A STARTTLS that the server refuses, or whose handshake fails, does not
//! abort delivery: the transaction continues in plaintext, redialing when
//! the failed handshake consumed the connection.

use crate::config::RelayConfig;
use crate::relay::{MxTransport, RelayError};
use crate::security::tls::client_connector;
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Longest reply line we accept from a server
const MAX_REPLY_LINE: usize = 4096;

/// Outbound connection, plain or TLS
enum MxStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MxStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MxStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MxStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MxStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MxStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MxStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MxStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A parsed (possibly multi-line) server reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn text(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" / "))
    }

    /// Whether an EHLO reply advertises `keyword`
    fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .map(|word| word.eq_ignore_ascii_case(keyword))
                .unwrap_or(false)
        })
    }
}

enum SessionError {
    Relay(RelayError),
    /// STARTTLS was accepted but the handshake failed; the socket is gone
    Handshake(String),
}

impl From<RelayError> for SessionError {
    fn from(error: RelayError) -> Self {
        SessionError::Relay(error)
    }
}

/// SMTP client for sending mail to recipient exchangers
///
/// # Examples
/// ```no_run
/// use mta_rs::config::RelayConfig;
/// use mta_rs::smtp::SmtpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("mail.brand.example", RelayConfig::default());
/// let accepted = client
///     .send_to_mx_server(
///         "mx.example.com",
///         "news@brand.example",
///         &["alice@example.com".to_string()],
///         b"Subject: Test\r\n\r\nHello!\r\n",
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpClient {
    helo_hostname: String,
    config: RelayConfig,
    tls: TlsConnector,
}

impl SmtpClient {
    pub fn new(helo_hostname: impl Into<String>, config: RelayConfig) -> Self {
        Self {
            helo_hostname: helo_hostname.into(),
            config,
            tls: client_connector(),
        }
    }

    #[cfg(test)]
    fn with_tls_connector(mut self, tls: TlsConnector) -> Self {
        self.tls = tls;
        self
    }

    /// Deliver to `host`, trying each preferred port in order
    pub async fn send_to_mx_server(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError> {
        let mut last_error = RelayError::Connection {
            host: host.to_string(),
            reason: "no ports configured".to_string(),
        };

        for &port in &self.config.preferred_ports {
            match self.deliver_on_port(host, port, from, recipients, data).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) => {
                    debug!("Delivery to {}:{} failed: {}", host, port, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn deliver_on_port(
        &self,
        host: &str,
        port: u16,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError> {
        match self.transaction(host, port, true, from, recipients, data).await {
            Ok(accepted) => Ok(accepted),
            Err(SessionError::Relay(e)) => Err(e),
            Err(SessionError::Handshake(reason)) => {
                warn!(
                    "STARTTLS handshake with {}:{} failed ({}), redialing without TLS",
                    host, port, reason
                );
                match self.transaction(host, port, false, from, recipients, data).await {
                    Ok(accepted) => Ok(accepted),
                    Err(SessionError::Relay(e)) => Err(e),
                    Err(SessionError::Handshake(reason)) => Err(RelayError::Connection {
                        host: host.to_string(),
                        reason,
                    }),
                }
            }
        }
    }

    async fn transaction(
        &self,
        host: &str,
        port: u16,
        try_starttls: bool,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, SessionError> {
        let mut conn = Connection {
            host,
            command_timeout: self.config.command_timeout(),
            stream: BufReader::new(self.connect(host, port).await?),
        };

        let greeting = conn.read_reply().await?;
        if greeting.code != 220 {
            return Err(conn.rejected("greeting", &greeting).into());
        }
        debug!("Connected to {}:{}: {}", host, port, greeting.text());

        let capabilities = self.greet(&mut conn).await?;

        let encrypted = port == self.config.implicit_tls_port;
        if !encrypted && try_starttls && capabilities.advertises("STARTTLS") {
            conn.command("STARTTLS").await?;
            let reply = conn.read_reply().await?;
            if reply.code == 220 {
                conn = self.upgrade(conn).await?;
                self.greet(&mut conn).await?;
                debug!("STARTTLS established with {}", host);
            } else {
                warn!("{} refused STARTTLS ({}), continuing without TLS", host, reply.text());
            }
        }

        conn.expect(&format!("MAIL FROM:<{}>", from), "MAIL FROM").await?;

        let mut accepted = Vec::new();
        for recipient in recipients {
            conn.command(&format!("RCPT TO:<{}>", recipient)).await?;
            let reply = conn.read_reply().await?;
            if reply.is_positive() {
                accepted.push(recipient.clone());
            } else {
                warn!("{} rejected recipient {}: {}", host, recipient, reply.text());
            }
        }

        if accepted.is_empty() {
            conn.quit().await;
            return Err(RelayError::NoRecipientsAccepted(host.to_string()).into());
        }

        conn.command("DATA").await?;
        let reply = conn.read_reply().await?;
        if reply.code != 354 {
            return Err(conn.rejected("DATA", &reply).into());
        }

        conn.write_raw(&dot_stuff(data)).await?;
        let reply = conn.read_reply().await?;
        if !reply.is_positive() {
            return Err(conn.rejected("message", &reply).into());
        }

        conn.quit().await;
        info!("{} accepted message for {} recipient(s)", host, accepted.len());
        Ok(accepted)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<MxStream, RelayError> {
        let connection_error = |reason: String| RelayError::Connection {
            host: host.to_string(),
            reason,
        };

        debug!("Connecting to {}:{}", host, port);
        let tcp = timeout(self.config.connect_timeout(), TcpStream::connect((host, port)))
            .await
            .map_err(|_| connection_error(format!("connect to port {} timed out", port)))?
            .map_err(|e| connection_error(format!("port {}: {}", port, e)))?;

        if port != self.config.implicit_tls_port {
            return Ok(MxStream::Plain(tcp));
        }

        let tls = self
            .handshake(host, tcp)
            .await
            .map_err(|reason| connection_error(format!("TLS on port {}: {}", port, reason)))?;
        Ok(MxStream::Tls(Box::new(tls)))
    }

    async fn handshake(&self, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>, String> {
        let server_name = rustls::ServerName::try_from(host).map_err(|e| e.to_string())?;
        timeout(self.config.command_timeout(), self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| "handshake timed out".to_string())?
            .map_err(|e| e.to_string())
    }

    async fn upgrade<'a>(&self, conn: Connection<'a>) -> Result<Connection<'a>, SessionError> {
        let Connection {
            host,
            command_timeout,
            stream,
        } = conn;

        let tcp = match stream.into_inner() {
            MxStream::Plain(tcp) => tcp,
            MxStream::Tls(_) => {
                return Err(RelayError::Connection {
                    host: host.to_string(),
                    reason: "STARTTLS on an encrypted connection".to_string(),
                }
                .into())
            }
        };

        let tls = self.handshake(host, tcp).await.map_err(SessionError::Handshake)?;
        Ok(Connection {
            host,
            command_timeout,
            stream: BufReader::new(MxStream::Tls(Box::new(tls))),
        })
    }

    /// EHLO, falling back to HELO for servers without ESMTP
    async fn greet(&self, conn: &mut Connection<'_>) -> Result<Reply, RelayError> {
        conn.command(&format!("EHLO {}", self.helo_hostname)).await?;
        let reply = conn.read_reply().await?;
        if reply.code == 250 {
            return Ok(reply);
        }

        debug!("{} refused EHLO ({}), trying HELO", conn.host, reply.text());
        conn.expect(&format!("HELO {}", self.helo_hostname), "HELO").await
    }
}

#[async_trait]
impl MxTransport for SmtpClient {
    async fn send(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Vec<String>, RelayError> {
        self.send_to_mx_server(host, from, recipients, data).await
    }
}

struct Connection<'a> {
    host: &'a str,
    command_timeout: Duration,
    stream: BufReader<MxStream>,
}

impl Connection<'_> {
    fn io_error(&self, error: impl std::fmt::Display) -> RelayError {
        RelayError::Connection {
            host: self.host.to_string(),
            reason: error.to_string(),
        }
    }

    fn rejected(&self, command: &str, reply: &Reply) -> RelayError {
        RelayError::Rejected {
            host: self.host.to_string(),
            command: command.to_string(),
            reply: reply.text(),
        }
    }

    /// Write a command line
    async fn command(&mut self, line: &str) -> Result<(), RelayError> {
        debug!("> {}", line);
        self.write_raw(format!("{}\r\n", line).as_bytes()).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        match timeout(self.command_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.io_error("write timed out")),
        }
    }

    /// Send a command and require a 2xx reply
    async fn expect(&mut self, line: &str, command: &str) -> Result<Reply, RelayError> {
        self.command(line).await?;
        let reply = self.read_reply().await?;
        if !reply.is_positive() {
            return Err(self.rejected(command, &reply));
        }
        Ok(reply)
    }

    /// Read a reply, following `250-` continuation lines
    async fn read_reply(&mut self) -> Result<Reply, RelayError> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = timeout(self.command_timeout, self.stream.read_line(&mut line)).await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.io_error(e)),
                Err(_) => return Err(self.io_error("reply timed out")),
            };
            if n == 0 {
                return Err(self.io_error("connection closed by server"));
            }
            if line.len() > MAX_REPLY_LINE {
                return Err(self.io_error("reply line too long"));
            }

            let line = line.trim_end();
            debug!("< {}", line);

            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| self.io_error(format!("malformed reply: {:?}", line)))?;
            let separator = line.as_bytes().get(3).copied();
            lines.push(line.get(4..).unwrap_or("").to_string());

            if separator != Some(b'-') {
                return Ok(Reply { code, lines });
            }
        }
    }

    /// Best-effort QUIT; the connection is dropped either way
    async fn quit(&mut self) {
        if self.command("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }
}

/// Escape leading dots and append the end-of-data marker
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut line_start = true;

    for &byte in data {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
