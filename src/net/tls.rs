//! TLS configuration and certificate loading.
//!
//! The server only needs a `rustls::ServerConfig`; where it comes from is a
//! [`TlsProvider`]. The default provider reads PEM files named in the
//! listener configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("TLS is enabled but no certificate is configured")]
    NotConfigured,
}

/// Source of the server-side TLS configuration.
pub trait TlsProvider: Send + Sync + 'static {
    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError>;
}

/// Certificate chain and key from PEM files.
#[derive(Debug, Clone)]
pub struct PemFileTls {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFileTls {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn from_config(config: &TlsConfig) -> Self {
        Self::new(&config.cert_path, &config.key_path)
    }
}

impl TlsProvider for PemFileTls {
    fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        load_tls_config(&self.cert_path, &self.key_path)
    }
}

/// Load a server configuration from certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    if !cert_path.exists() {
        return Err(TlsError::NotFound(cert_path.to_path_buf()));
    }
    if !key_path.exists() {
        return Err(TlsError::NotFound(key_path.to_path_buf()));
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::info!(cert = ?cert_path, "TLS configuration loaded");
    Ok(Arc::new(config))
}

pub fn acceptor(provider: &dyn TlsProvider) -> Result<TlsAcceptor, TlsError> {
    Ok(TlsAcceptor::from(provider.server_config()?))
}
