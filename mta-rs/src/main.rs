use anyhow::Context;
use mta_rs::config::Config;
use mta_rs::security::TlsConfig;
use mta_rs::smtp::{SessionServices, SmtpClient, SmtpServer};
use mta_rs::storage::MemoryStore;
use mta_rs::utils::SystemResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional config file path as the only argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    init_logging(&config);

    info!("Starting mta-rs");
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    let hostname = config.server.effective_hostname();
    info!("  Hostname: {}", hostname);
    info!("  Authentication required: {}", config.smtp.require_auth);

    let tls = match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
        (Some(cert), Some(key)) => {
            Some(TlsConfig::from_pem_files(cert, key).context("Failed to load TLS certificate")?)
        }
        (None, None) => {
            warn!("No TLS certificate configured, STARTTLS disabled");
            None
        }
        _ => anyhow::bail!("tls_cert_path and tls_key_path must be set together"),
    };

    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(SystemResolver::new());
    let transport = Arc::new(SmtpClient::new(hostname, config.relay.clone()));
    let services = Arc::new(SessionServices::from_config(&config, store, resolver, transport, tls));

    // Periodically drop expired rate limiter state
    let rate_limiter = services.rate_limiter.clone();
    let cleanup_interval = Duration::from_secs(config.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            rate_limiter.cleanup().await;
        }
    });

    let server = SmtpServer::new(services);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server.run_until_shutdown(shutdown).await?;
    info!("mta-rs stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let (json, pretty) = if config.logging.format.eq_ignore_ascii_case("json") {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().pretty()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
}
