use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `MTA__SMTP__LISTEN_ADDR`
const ENV_PREFIX: &str = "MTA";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub spf: SpfConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// How often the server binary prunes rate limiter state
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name used in the SMTP greeting and as the outbound HELO domain;
    /// empty means the machine's own name
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub require_auth: bool,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Run bounce bookkeeping inline and fail DATA when it fails
    pub strict_bounce_bookkeeping: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub connections_per_ip: usize,
    pub connection_window_secs: u64,
    pub messages_per_ip: usize,
    pub message_window_secs: u64,
    pub recipients_per_message: usize,
    pub monthly_quota: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpfConfig {
    pub max_lookups: usize,
    pub cache_duration_secs: u64,
    pub dns_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub preferred_ports: Vec<u16>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub dns_timeout_ms: u64,
    /// Port dialed with TLS from the first byte (RFC 8314)
    #[serde(default = "default_implicit_tls_port")]
    pub implicit_tls_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_implicit_tls_port() -> u16 {
    465
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "mail.localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            require_auth: true,
            max_message_bytes: 1024 * 1024, // 1 MiB
            max_recipients: 50,
            read_timeout_secs: 600,
            write_timeout_secs: 600,
            strict_bounce_bookkeeping: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: 10,
            connection_window_secs: 60,
            messages_per_ip: 30,
            message_window_secs: 60,
            recipients_per_message: 50,
            monthly_quota: 10_000,
        }
    }
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_lookups: 10,
            cache_duration_secs: 300,
            dns_timeout_ms: 5_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            preferred_ports: vec![587, 465, 25],
            retry_attempts: 3,
            retry_delay_ms: 5_000,
            connect_timeout_secs: 30,
            command_timeout_secs: 300,
            dns_timeout_ms: 5_000,
            implicit_tls_port: default_implicit_tls_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            smtp: SmtpConfig::default(),
            rate_limit: RateLimitConfig::default(),
            spf: SpfConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))
    }

    /// Load defaults, then the optional TOML file, then `MTA__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| MailError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("relay.preferred_ports")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MailError::Config(e.to_string()))
    }
}

impl ServerConfig {
    /// The configured hostname, or the machine's when none is set
    pub fn effective_hostname(&self) -> String {
        let configured = self.hostname.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        gethostname::gethostname().to_string_lossy().to_string()
    }
}

impl SmtpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl RateLimitConfig {
    pub fn connection_window(&self) -> Duration {
        Duration::from_secs(self.connection_window_secs)
    }

    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_secs)
    }
}

impl SpfConfig {
    pub fn cache_duration(&self) -> Duration {
        Duration::from_secs(self.cache_duration_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_server_limits() {
        let config = Config::default();
        assert_eq!(config.smtp.max_message_bytes, 1024 * 1024);
        assert_eq!(config.smtp.max_recipients, 50);
        assert_eq!(config.smtp.read_timeout(), Duration::from_secs(600));
        assert_eq!(config.relay.preferred_ports, vec![587, 465, 25]);
        assert_eq!(config.spf.max_lookups, 10);
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nhostname = \"mx.example.org\"\n\n[relay]\npreferred_ports = [25]\nretry_attempts = 5\nretry_delay_ms = 10\nconnect_timeout_secs = 1\ncommand_timeout_secs = 1\ndns_timeout_ms = 100"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.hostname, "mx.example.org");
        assert_eq!(config.relay.preferred_ports, vec![25]);
        assert_eq!(config.relay.retry_attempts, 5);
        assert_eq!(config.relay.implicit_tls_port, 465);
        // Missing sections fall back to defaults
        assert_eq!(config.smtp.max_recipients, 50);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.smtp.listen_addr, "0.0.0.0:2525");
        assert_eq!(config.cleanup_interval_secs, 300);
    }

    #[test]
    fn test_empty_hostname_uses_machine_name() {
        let mut server = ServerConfig::default();
        assert_eq!(server.effective_hostname(), "mail.localhost");

        server.hostname = "  ".to_string();
        let hostname = server.effective_hostname();
        assert!(!hostname.is_empty());
        assert_eq!(hostname, gethostname::gethostname().to_string_lossy());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/mta.toml").is_err());
    }
}
