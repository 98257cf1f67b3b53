//! Secure transport collaborator.
//!
//! The engine treats TLS as an opaque upgrade step: given an established
//! [`Connection`] and the name of the server, a [`SecureTransport`] returns a new
//! connection that reads and writes plaintext over an encrypted session. The
//! default implementation is [`RustlsTransport`].

use crate::client::TlsConfig;
use crate::error::{EngineError, Result};
use crate::io::connection::Connection;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::warn;

/// Upgrades a raw connection to a secure one.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Run the handshake over `connection`, authenticating the peer as `server_name`.
    async fn upgrade(&self, connection: Connection, server_name: &str) -> Result<Connection>;
}

/// [`SecureTransport`] backed by rustls.
#[derive(Clone)]
pub struct RustlsTransport {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl RustlsTransport {
    /// Build a transport from trust settings.
    ///
    /// Extra root certificates that fail to parse are skipped with a warning.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        if config.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for der in &config.extra_root_certificates {
            if let Err(err) = roots.add(CertificateDer::from(der.clone())) {
                warn!(error = %err, "skipping invalid root certificate");
            }
        }

        let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|err| EngineError::Handshake(err.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(RustlsTransport {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        })
    }
}

impl std::fmt::Debug for RustlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsTransport")
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[async_trait]
impl SecureTransport for RustlsTransport {
    async fn upgrade(&self, connection: Connection, server_name: &str) -> Result<Connection> {
        let name = self.server_name.as_deref().unwrap_or(server_name);
        let name = ServerName::try_from(name.to_string())
            .map_err(|err| EngineError::Handshake(format!("invalid server name {name:?}: {err}")))?;
        let stream = self
            .connector
            .connect(name, connection)
            .await
            .map_err(|err| EngineError::Handshake(err.to_string()))?;
        Ok(Connection::stream(stream))
    }
}
