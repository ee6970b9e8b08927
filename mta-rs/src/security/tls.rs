//! TLS for inbound STARTTLS and outbound relay connections
//!
//! - [`TlsConfig`]: server side, loaded from PEM files, used for STARTTLS
//!   on the submission listener
//! - [`client_connector`]: client side, used when relaying to MX hosts
//!   (implicit TLS on 465, opportunistic STARTTLS elsewhere)
//!
//! Certificate provisioning is handled outside this crate.

use crate::error::{MailError, Result};
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// TLS configuration for the SMTP listener
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    ///
    /// # Examples
    /// ```no_run
    /// use mta_rs::security::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls_config = TlsConfig::from_pem_files(
    ///     "/etc/mail/cert.pem",
    ///     "/etc/mail/key.pem"
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref()).map_err(|e| {
            MailError::Tls(format!("Failed to open certificate file: {}", e))
        })?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(MailError::Tls("No certificates found in file".to_string()));
        }

        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref()).map_err(|e| {
            MailError::Tls(format!("Failed to open key file: {}", e))
        })?;
        let mut key_reader = BufReader::new(key_file);

        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;

        if keys.is_empty() {
            return Err(MailError::Tls("No private key found in file".to_string()));
        }

        let private_key = keys.remove(0);

        // rustls 0.21 API
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        info!("TLS configuration created successfully");

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Create a TLS acceptor for STARTTLS
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Client connector trusting the Mozilla root set
pub fn client_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
