use crate::authentication::{SpfResult, SpfValidator};
use crate::config::{Config, SmtpConfig};
use crate::error::{MailError, Result};
use crate::relay::{Email, MxTransport, RelayService};
use crate::security::auth::{decode_login_credential, login_prompt, LoginStep};
use crate::security::{AuthError, AuthMechanism, Authenticator, Credentials, RateLimiter, TlsConfig};
use crate::smtp::bounce::{self, Bounce};
use crate::smtp::commands::{EsmtpParam, SmtpCommand};
use crate::storage::{Store, StoreError};
use crate::utils::dns::DnsResolver;
use crate::utils::{extract_domain, local_part, validate_email};
use mail_parser::MessageParser;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Maximum length of a SASL continuation line (RFC 4954)
const MAX_AUTH_LINE_LENGTH: usize = 12288;

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Mailbox recording messages an account has sent
const SENT_MAILBOX: &str = "Sent";

/// Unified stream type for both plain and TLS connections
///
/// Lets a session upgrade through STARTTLS without changing the type the
/// command loop reads from.
enum SmtpStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SmtpStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SmtpStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// One SMTP reply, possibly multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// Wire form with `code-` continuation lines and CRLF endings
    pub fn to_wire(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, separator, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{} \r\n", self.code));
        }
        out
    }
}

/// Shared services every session works against
pub struct SessionServices {
    pub hostname: String,
    pub config: SmtpConfig,
    pub rate_limiter: Arc<RateLimiter>,
    pub spf: Arc<SpfValidator>,
    pub relay: Arc<RelayService>,
    pub authenticator: Authenticator,
    pub store: Arc<dyn Store>,
    pub tls: Option<TlsConfig>,
}

impl SessionServices {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        resolver: Arc<dyn DnsResolver>,
        transport: Arc<dyn MxTransport>,
        tls: Option<TlsConfig>,
    ) -> Self {
        Self {
            hostname: config.server.effective_hostname(),
            config: config.smtp.clone(),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            spf: Arc::new(SpfValidator::new(resolver.clone(), config.spf.clone())),
            relay: Arc::new(RelayService::new(resolver, transport, config.relay.clone())),
            authenticator: Authenticator::new(store.clone()),
            store,
            tls,
        }
    }
}

/// Outcome of reading one line from the client
enum Input {
    Line(Vec<u8>),
    TooLong,
    Closed,
    TimedOut,
}

/// SMTP session handler with security limits and validation
///
/// Protocol operations ([`mail`](Self::mail), [`rcpt`](Self::rcpt),
/// [`deliver`](Self::deliver), ...) only compute replies; [`run`](Self::run)
/// owns the connection and writes them.
///
/// # Security features
/// - Command and DATA timeouts to prevent slowloris attacks
/// - Bounded line and message sizes
/// - Error counting to detect malicious clients
/// - STARTTLS and SMTP AUTH
/// - SPF check of the envelope sender
pub struct SmtpSession {
    services: Arc<SessionServices>,
    state: SmtpState,
    remote_ip: IpAddr,
    helo_domain: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    authenticated_user: Option<String>,
    error_count: usize,
    is_encrypted: bool,
}

impl SmtpSession {
    pub fn new(services: Arc<SessionServices>, remote_ip: IpAddr) -> Self {
        Self {
            services,
            state: SmtpState::Fresh,
            remote_ip,
            helo_domain: None,
            from: None,
            to: Vec::new(),
            authenticated_user: None,
            error_count: 0,
            is_encrypted: false,
        }
    }

    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.to
    }

    pub fn greeting(&self) -> SmtpReply {
        SmtpReply::new(220, format!("{} ESMTP Service Ready", self.services.hostname))
    }

    /// Mechanisms advertised in EHLO
    pub fn auth_mechanisms(&self) -> Vec<&'static str> {
        AuthMechanism::SUPPORTED.iter().map(|m| m.as_str()).collect()
    }

    pub fn helo(&mut self, domain: &str) -> SmtpReply {
        info!("HELO from {} ({})", domain, self.remote_ip);
        self.greet(domain);
        SmtpReply::new(250, format!("{} Hello {}", self.services.hostname, domain))
    }

    pub fn ehlo(&mut self, domain: &str) -> SmtpReply {
        info!("EHLO from {} ({})", domain, self.remote_ip);
        self.greet(domain);

        let tls_available = self.services.tls.is_some();
        let mut lines = vec![format!("{} Hello {}", self.services.hostname, domain)];
        if tls_available && !self.is_encrypted {
            lines.push("STARTTLS".to_string());
        }
        lines.push(format!("SIZE {}", self.services.config.max_message_bytes));
        // Credentials only travel encrypted when TLS is available
        if !tls_available || self.is_encrypted {
            lines.push(format!("AUTH {}", self.auth_mechanisms().join(" ")));
        }
        SmtpReply::multiline(250, lines)
    }

    fn greet(&mut self, domain: &str) {
        self.helo_domain = Some(domain.to_string());
        self.clear_transaction();
        self.state = SmtpState::Greeted;
    }

    /// Validate an AUTH command before any SASL exchange
    fn auth_precheck(&self, mechanism: &str) -> std::result::Result<AuthMechanism, SmtpReply> {
        if self.authenticated_user.is_some() {
            return Err(SmtpReply::new(503, "Already authenticated"));
        }
        if self.state != SmtpState::Greeted {
            return Err(SmtpReply::new(503, "Bad sequence of commands"));
        }
        if self.services.tls.is_some() && !self.is_encrypted {
            return Err(SmtpReply::new(530, "Must issue STARTTLS first"));
        }
        AuthMechanism::parse(mechanism)
            .ok_or_else(|| SmtpReply::new(504, "Authentication mechanism not supported"))
    }

    /// Verify decoded SASL credentials
    pub async fn authenticate(&mut self, mechanism: AuthMechanism, credentials: Credentials) -> SmtpReply {
        if self.authenticated_user.is_some() {
            return SmtpReply::new(503, "Already authenticated");
        }

        match self
            .services
            .authenticator
            .authenticate(mechanism, &credentials)
            .await
        {
            Ok(identity) => {
                info!("Authentication successful for {} from {}", identity, self.remote_ip);
                self.authenticated_user = Some(identity);
                SmtpReply::new(235, "Authentication successful")
            }
            Err(AuthError::Invalid) => {
                warn!("Authentication failed for {} from {}", credentials.username, self.remote_ip);
                SmtpReply::new(535, "Authentication credentials invalid")
            }
            Err(AuthError::Temporary(e)) => {
                error!("Authentication unavailable: {}", e);
                SmtpReply::new(454, "Temporary authentication failure")
            }
            Err(AuthError::Malformed(e)) => SmtpReply::new(501, format!("Malformed authentication data: {}", e)),
        }
    }

    pub async fn mail(&mut self, from: &str, params: &[EsmtpParam]) -> SmtpReply {
        match self.state {
            SmtpState::Fresh => return SmtpReply::new(503, "Send HELO/EHLO first"),
            SmtpState::Greeted => {}
            _ => return SmtpReply::new(503, "Sender already specified"),
        }

        if from.is_empty() {
            warn!("Null sender rejected from {}", self.remote_ip);
            return SmtpReply::new(501, "Null sender not accepted");
        }

        if self.services.config.require_auth && self.authenticated_user.is_none() {
            warn!("MAIL FROM rejected: authentication required");
            return SmtpReply::new(530, "Authentication required");
        }

        let max = self.services.config.max_message_bytes;
        if let Some(size) = params.iter().find_map(EsmtpParam::size) {
            if size > max {
                warn!("Declared message size {} exceeds {}", size, max);
                return SmtpReply::new(552, format!("Message size exceeds maximum of {} bytes", max));
            }
        }

        // Validate email address (security: prevent injection)
        let domain = match validate_email(from).and_then(|_| extract_domain(from)) {
            Ok(domain) => domain,
            Err(e) => return SmtpReply::new(501, e.to_string()),
        };

        let spf = self
            .services
            .spf
            .check_host(self.remote_ip, &domain, from)
            .await
            .unwrap_or_else(|e| {
                warn!("SPF evaluation for {} failed: {}", domain, e);
                e.result()
            });

        if !spf.should_accept() {
            warn!("SPF {} for {} from {}", spf, from, self.remote_ip);
            if spf == SpfResult::TempError {
                return SmtpReply::new(451, "Temporary SPF failure, try again later");
            }
            return SmtpReply::new(550, format!("SPF check failed for {} ({})", domain, spf));
        }
        if spf == SpfResult::SoftFail {
            info!("SPF softfail for {} from {}, accepting", from, self.remote_ip);
        }

        info!("MAIL FROM: {}", from);
        self.from = Some(from.to_string());
        self.to.clear();
        self.state = SmtpState::MailFrom;
        SmtpReply::ok()
    }

    pub fn rcpt(&mut self, to: &str, params: &[EsmtpParam]) -> SmtpReply {
        if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
            return SmtpReply::new(503, "Need MAIL command first");
        }
        if to.is_empty() {
            return SmtpReply::new(501, "Empty recipient");
        }
        if let Err(e) = validate_email(to) {
            return SmtpReply::new(501, e.to_string());
        }

        if self.to.iter().any(|r| r.eq_ignore_ascii_case(to)) {
            debug!("Duplicate recipient {} ignored", to);
            return SmtpReply::ok();
        }

        // Check recipient limit (security: prevent spam)
        let max = self.services.config.max_recipients;
        if self.to.len() >= max {
            warn!("Too many recipients: {}", self.to.len());
            return SmtpReply::new(452, format!("Too many recipients (max {})", max));
        }

        if !params.is_empty() {
            debug!("Ignoring RCPT parameters for {}: {:?}", to, params);
        }

        info!("RCPT TO: {}", to);
        self.to.push(to.to_string());
        self.state = SmtpState::RcptTo;
        SmtpReply::ok()
    }

    /// Admit the message through the rate limiter before the body is read
    pub async fn begin_data(&mut self) -> SmtpReply {
        if self.state != SmtpState::RcptTo || self.to.is_empty() {
            return SmtpReply::new(503, "No valid recipients");
        }

        let from = self.from.clone().unwrap_or_default();
        if let Err(e) = self
            .services
            .rate_limiter
            .check_message(self.remote_ip, &from, &self.to)
            .await
        {
            warn!("Message from {} rejected: {}", from, e);
            return SmtpReply::new(452, e.to_string());
        }

        info!("DATA command received");
        self.state = SmtpState::Data;
        SmtpReply::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    /// Admit and deliver a complete message in one step
    pub async fn data(&mut self, message: &[u8]) -> SmtpReply {
        let reply = self.begin_data().await;
        if !reply.is_positive() {
            return reply;
        }
        self.deliver(message).await
    }

    /// Relay a received message and record it
    ///
    /// The envelope is consumed whatever the outcome.
    pub async fn deliver(&mut self, message: &[u8]) -> SmtpReply {
        if self.state != SmtpState::Data {
            return SmtpReply::new(503, "Bad sequence of commands");
        }
        let from = self.from.take().unwrap_or_default();
        let to = std::mem::take(&mut self.to);
        self.state = SmtpState::Greeted;

        if message.is_empty() {
            warn!("Empty message received");
            return SmtpReply::new(554, "Empty message");
        }

        if MessageParser::default().parse(message).is_none() {
            return SmtpReply::new(554, "Message could not be parsed");
        }

        // Header values are carried as submitted so encoded words survive
        let (header_block, body) = split_message(message);
        let fields = parse_headers(header_block);
        let subject = header_value(&fields, "Subject").unwrap_or_default();

        if let Some(e) = std::iter::once(&from)
            .chain(to.iter())
            .find_map(|address| validate_email(address).err())
        {
            return SmtpReply::new(501, e.to_string());
        }

        let mut email = Email::new(from.clone(), to.clone(), subject, body.to_vec())
            .with_header("X-Source-IP", self.remote_ip.to_string());
        if let Some(content_type) = header_value(&fields, "Content-Type") {
            email = email.with_content_type(content_type);
        }
        for (name, value) in &fields {
            if is_content_header(name) && !name.eq_ignore_ascii_case("Content-Type") {
                email = email.with_header(name.clone(), value.clone());
            }
        }

        let report = self.services.relay.relay_email(&email).await;
        let delivered = report.accepted_recipients();
        if let Err(e) = report.into_result() {
            error!("Relay of message from {} failed: {}", from, e);
            return SmtpReply::new(550, format!("Relay failed: {}", e));
        }

        let strict = self.services.config.strict_bounce_bookkeeping;
        if let Err(e) = self.record_delivery(&from, &to, &delivered).await {
            error!("Delivery bookkeeping for {} failed: {}", from, e);
            if strict {
                return SmtpReply::new(451, "Message relayed but bookkeeping failed");
            }
        }

        let bounces = bounce::scan(&String::from_utf8_lossy(body));
        if !bounces.is_empty() {
            info!("Message from {} reports {} bounce(s)", from, bounces.len());
            let store = self.services.store.clone();
            if strict {
                if let Err(e) = record_bounces(store.as_ref(), &bounces).await {
                    error!("Bounce bookkeeping failed: {}", e);
                    return SmtpReply::new(451, "Message relayed but bounce bookkeeping failed");
                }
            } else {
                tokio::spawn(async move {
                    if let Err(e) = record_bounces(store.as_ref(), &bounces).await {
                        warn!("Bounce bookkeeping failed: {}", e);
                    }
                });
            }
        }

        info!(
            "Message from {} (HELO {}) accepted for {} recipient(s)",
            from,
            self.helo_domain.as_deref().unwrap_or("unknown"),
            delivered.len()
        );
        SmtpReply::new(250, "OK: Message accepted for delivery")
    }

    async fn record_delivery(&self, from: &str, to: &[String], delivered: &[String]) -> std::result::Result<(), StoreError> {
        let owner = local_part(from).map_err(|e| StoreError::Rejected(e.to_string()))?;
        self.services
            .store
            .create_email_box(owner, SENT_MAILBOX, from, to)
            .await?;

        for recipient in delivered {
            self.services.store.mark_email_as_delivered(recipient).await?;
        }
        Ok(())
    }

    /// RSET; keeps the greeting and authentication
    pub fn reset(&mut self) -> SmtpReply {
        info!("RSET command");
        self.clear_transaction();
        if self.state != SmtpState::Fresh {
            self.state = SmtpState::Greeted;
        }
        SmtpReply::ok()
    }

    pub fn logout(&self) -> SmtpReply {
        info!("QUIT command");
        SmtpReply::new(221, format!("{} closing connection", self.services.hostname))
    }

    fn clear_transaction(&mut self) {
        self.from = None;
        self.to.clear();
        if self.state != SmtpState::Fresh {
            self.state = SmtpState::Greeted;
        }
    }

    /// Commands that need no further client input
    pub async fn handle_command(&mut self, command: SmtpCommand) -> SmtpReply {
        match command {
            SmtpCommand::Helo(domain) => self.helo(&domain),
            SmtpCommand::Ehlo(domain) => self.ehlo(&domain),
            SmtpCommand::MailFrom { address, params } => self.mail(&address, &params).await,
            SmtpCommand::RcptTo { address, params } => self.rcpt(&address, &params),
            SmtpCommand::Rset => self.reset(),
            SmtpCommand::Noop => SmtpReply::ok(),
            SmtpCommand::Quit => self.logout(),
            // Handled by the connection loop
            SmtpCommand::Data | SmtpCommand::StartTls | SmtpCommand::Auth { .. } => {
                error!("Connection-level command reached handle_command");
                SmtpReply::new(503, "Bad sequence of commands")
            }
            SmtpCommand::Unknown(cmd) => {
                warn!("Unknown command: {}", cmd);
                SmtpReply::new(502, "Command not implemented")
            }
        }
    }

    fn starttls_acceptor(&self) -> std::result::Result<TlsAcceptor, SmtpReply> {
        let tls = match &self.services.tls {
            Some(tls) => tls,
            None => return Err(SmtpReply::new(502, "STARTTLS not available")),
        };
        if self.is_encrypted {
            return Err(SmtpReply::new(503, "Already using TLS"));
        }
        if self.state != SmtpState::Greeted {
            return Err(SmtpReply::new(503, "Bad sequence of commands"));
        }
        Ok(tls.acceptor())
    }

    /// Drive the session over `stream` until QUIT or disconnect
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(SmtpStream::Plain(stream));
        let greeting = self.greeting();
        self.send(&mut reader, &greeting).await?;

        loop {
            // Check error count (security: disconnect abusive clients)
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors from {}, disconnecting", self.remote_ip);
                let reply = SmtpReply::new(421, "Too many errors, closing connection");
                self.send(&mut reader, &reply).await?;
                break;
            }

            let line = match self.read_line(&mut reader, MAX_LINE_LENGTH).await? {
                Input::Line(line) => line,
                Input::TooLong => {
                    error!("Line too long from {}", self.remote_ip);
                    self.send(&mut reader, &SmtpReply::new(500, "Line too long")).await?;
                    continue;
                }
                Input::Closed => {
                    debug!("Client disconnected");
                    break;
                }
                Input::TimedOut => {
                    warn!("Command timeout, disconnecting {}", self.remote_ip);
                    let reply = SmtpReply::new(421, "Timeout, closing connection");
                    self.send(&mut reader, &reply).await?;
                    break;
                }
            };

            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            if line.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("AUTH ")) {
                debug!("Received: AUTH ...");
            } else {
                debug!("Received: {}", line);
            }

            let command = match SmtpCommand::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    let reply = if line.is_empty() {
                        SmtpReply::new(500, "Syntax error, command unrecognized")
                    } else {
                        SmtpReply::new(501, "Syntax error in parameters or arguments")
                    };
                    self.send(&mut reader, &reply).await?;
                    continue;
                }
            };

            match command {
                SmtpCommand::Quit => {
                    let reply = self.logout();
                    self.send(&mut reader, &reply).await?;
                    break;
                }
                SmtpCommand::StartTls => match self.starttls_acceptor() {
                    Ok(acceptor) => {
                        info!("STARTTLS: Initiating TLS upgrade");
                        self.send(&mut reader, &SmtpReply::new(220, "Ready to start TLS")).await?;
                        reader = self.upgrade(reader, acceptor).await?;
                    }
                    Err(reply) => self.send(&mut reader, &reply).await?,
                },
                SmtpCommand::Auth {
                    mechanism,
                    initial_response,
                } => {
                    let reply = self.handle_auth(&mut reader, &mechanism, initial_response).await?;
                    self.send(&mut reader, &reply).await?;
                }
                SmtpCommand::Data => {
                    let reply = self.begin_data().await;
                    let accepted = reply.is_positive();
                    self.send(&mut reader, &reply).await?;

                    if accepted {
                        let reply = match self.read_message(&mut reader).await? {
                            Some(message) => self.deliver(&message).await,
                            None => {
                                self.clear_transaction();
                                let max = self.services.config.max_message_bytes;
                                SmtpReply::new(552, format!("Message exceeds maximum size of {} bytes", max))
                            }
                        };
                        self.send(&mut reader, &reply).await?;
                    }
                }
                command => {
                    let reply = self.handle_command(command).await;
                    self.send(&mut reader, &reply).await?;
                }
            }
        }

        Ok(())
    }

    async fn send<W>(&mut self, writer: &mut W, reply: &SmtpReply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if reply.code >= 500 {
            self.error_count += 1;
        }

        let wire = reply.to_wire();
        let write = async {
            writer.write_all(wire.as_bytes()).await?;
            writer.flush().await
        };
        match timeout(self.services.config.write_timeout(), write).await {
            Ok(result) => result.map_err(MailError::from),
            Err(_) => Err(MailError::Timeout("writing reply".to_string())),
        }
    }

    async fn read_line<R>(&self, reader: &mut R, limit: usize) -> Result<Input>
    where
        R: AsyncBufRead + Unpin,
    {
        match timeout(self.services.config.read_timeout(), read_line_bounded(reader, limit)).await {
            Ok(result) => Ok(result?),
            Err(_) => Ok(Input::TimedOut),
        }
    }

    /// Read DATA up to the terminating dot
    ///
    /// Returns `None` when the message exceeded the size limit; the rest of
    /// it has been drained so the session can continue.
    async fn read_message<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncBufRead + Unpin,
    {
        let max = self.services.config.max_message_bytes;
        let mut data = Vec::new();
        let mut too_large = false;

        loop {
            let line = match self.read_line(reader, max + 2).await? {
                Input::Line(line) => line,
                Input::TooLong => {
                    too_large = true;
                    continue;
                }
                Input::Closed => {
                    return Err(MailError::SmtpProtocol("Connection closed during DATA".to_string()))
                }
                Input::TimedOut => return Err(MailError::Timeout("DATA".to_string())),
            };

            if line == b".\r\n" || line == b".\n" {
                break;
            }
            if too_large {
                continue;
            }

            // Handle transparency (lines starting with .)
            let content = line.strip_prefix(b".").unwrap_or(&line);
            if data.len() + content.len() > max {
                warn!("Message too large from {} (max {} bytes)", self.remote_ip, max);
                too_large = true;
                data = Vec::new();
                continue;
            }
            data.extend_from_slice(content);
        }

        if too_large {
            return Ok(None);
        }
        info!("End of DATA received, total size: {} bytes", data.len());
        Ok(Some(data))
    }

    async fn handle_auth<R>(
        &mut self,
        reader: &mut R,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> Result<SmtpReply>
    where
        R: AsyncBufRead + AsyncWrite + Unpin,
    {
        let mechanism = match self.auth_precheck(mechanism) {
            Ok(mechanism) => mechanism,
            Err(reply) => return Ok(reply),
        };
        info!("AUTH {} initiated from {}", mechanism.as_str(), self.remote_ip);

        let credentials = match mechanism {
            AuthMechanism::Plain => {
                let response = match initial_response {
                    Some(response) => response,
                    None => match self.challenge(reader, "").await? {
                        Ok(response) => response,
                        Err(reply) => return Ok(reply),
                    },
                };
                Credentials::decode_plain(&response)
            }
            AuthMechanism::Login => {
                let username = match initial_response {
                    Some(username) => username,
                    None => match self.challenge(reader, login_prompt(LoginStep::Username)).await? {
                        Ok(username) => username,
                        Err(reply) => return Ok(reply),
                    },
                };
                let password = match self.challenge(reader, login_prompt(LoginStep::Password)).await? {
                    Ok(password) => password,
                    Err(reply) => return Ok(reply),
                };
                decode_login_credential(&username).and_then(|username| {
                    decode_login_credential(&password).map(|password| Credentials::new(username, password))
                })
            }
        };

        match credentials {
            Ok(credentials) => Ok(self.authenticate(mechanism, credentials).await),
            Err(e) => {
                warn!("AUTH {} from {}: {}", mechanism.as_str(), self.remote_ip, e);
                Ok(SmtpReply::new(501, e.to_string()))
            }
        }
    }

    /// Send a `334` prompt and read the client's answer
    async fn challenge<R>(&mut self, reader: &mut R, prompt: &str) -> Result<std::result::Result<String, SmtpReply>>
    where
        R: AsyncBufRead + AsyncWrite + Unpin,
    {
        self.send(reader, &SmtpReply::new(334, prompt)).await?;

        match self.read_line(reader, MAX_AUTH_LINE_LENGTH).await? {
            Input::Line(line) => {
                let response = String::from_utf8_lossy(&line).trim().to_string();
                if response == "*" {
                    Ok(Err(SmtpReply::new(501, "Authentication cancelled")))
                } else {
                    Ok(Ok(response))
                }
            }
            Input::TooLong => Ok(Err(SmtpReply::new(500, "Line too long"))),
            Input::Closed => Err(MailError::SmtpProtocol("Connection closed during AUTH".to_string())),
            Input::TimedOut => Err(MailError::Timeout("AUTH".to_string())),
        }
    }

    async fn upgrade<S>(
        &mut self,
        reader: BufReader<SmtpStream<S>>,
        acceptor: TlsAcceptor,
    ) -> Result<BufReader<SmtpStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Anything the client pipelined after STARTTLS is discarded with the buffer
        let plain = match reader.into_inner() {
            SmtpStream::Plain(stream) => stream,
            SmtpStream::Tls(_) => return Err(MailError::Tls("stream already encrypted".to_string())),
        };

        let handshake = timeout(self.services.config.read_timeout(), acceptor.accept(plain)).await;
        let tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                error!("TLS handshake failed: {}", e);
                return Err(MailError::Tls(format!("TLS handshake failed: {}", e)));
            }
            Err(_) => return Err(MailError::Timeout("TLS handshake".to_string())),
        };

        // Reset state - client must send EHLO again after STARTTLS (RFC 3207)
        self.is_encrypted = true;
        self.helo_domain = None;
        self.clear_transaction();
        self.state = SmtpState::Fresh;

        info!("STARTTLS: TLS upgrade completed successfully");
        Ok(BufReader::new(SmtpStream::Tls(Box::new(tls))))
    }
}

/// Read one line of at most `limit` bytes, draining the rest of longer lines
async fn read_line_bounded<R>(reader: &mut R, limit: usize) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Input::Closed);
        }

        let (chunk_len, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };

        if !overflow {
            if line.len() + chunk_len > limit {
                overflow = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(&available[..chunk_len]);
            }
        }
        reader.consume(chunk_len);

        if complete {
            return Ok(if overflow { Input::TooLong } else { Input::Line(line) });
        }
    }
}

async fn record_bounces(store: &dyn Store, bounces: &[Bounce]) -> std::result::Result<(), StoreError> {
    for bounce in bounces {
        store
            .update_bounce_status(&bounce.recipient, bounce.bounce_type.as_str())
            .await?;
    }
    Ok(())
}

/// Split a message into its header block and body, on the raw octets
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let first_line = raw.split(|&b| b == b'\n').next().unwrap_or(raw);
    if !first_line.contains(&b':') {
        return (&raw[..0], raw);
    }
    if let Some(i) = find(raw, b"\r\n\r\n") {
        return (&raw[..i], &raw[i + 4..]);
    }
    if let Some(i) = find(raw, b"\n\n") {
        return (&raw[..i], &raw[i + 2..]);
    }
    (raw, &raw[raw.len()..])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Header fields in order, continuation lines unfolded
fn parse_headers(block: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(block);
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    fields
}

/// Value of the first field named `name`
fn header_value(fields: &[(String, String)], name: &str) -> Option<String> {
    fields
        .iter()
        .find(|(field, _)| field.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

/// MIME `Content-*` fields describe the body and travel with it
fn is_content_header(name: &str) -> bool {
    name.get(..8).map_or(false, |prefix| prefix.eq_ignore_ascii_case("content-"))
}
