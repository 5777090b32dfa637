//! Mutual-TLS material for the RPC listener.
//!
//! The server presents its own certificate and requires every client to
//! present one signed by the configured CA. The client certificate CN is
//! the caller's identity.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS needs --ca_file, --cert_file and --key_file together; missing {0}")]
    Partial(&'static str),

    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Loaded TLS materials ready for use with tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Loads the CA, certificate and key named by `config`.
    ///
    /// Returns `Ok(None)` when no TLS file is configured and an error when
    /// only some of them are.
    pub async fn load(config: &TlsConfig) -> Result<Option<Self>, TlsError> {
        if !config.is_complete() {
            return match missing(config) {
                Some(what) if config.is_partial() => Err(TlsError::Partial(what)),
                _ => Ok(None),
            };
        }
        let (Some(ca), Some(cert), Some(key)) =
            (&config.ca_cert_path, &config.cert_path, &config.key_path)
        else {
            return Ok(None);
        };

        let ca_pem = read("CA certificate", ca).await?;
        let cert_pem = read("server certificate", cert).await?;
        let key_pem = read("server key", key).await?;
        Ok(Some(Self::from_pem(ca_pem, cert_pem, key_pem)))
    }

    pub fn from_pem(
        ca_pem: impl AsRef<[u8]>,
        cert_pem: impl AsRef<[u8]>,
        key_pem: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        }
    }

    /// Server side: present our certificate, require client certificates
    /// signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side, presenting this identity to a server whose certificate
    /// is valid for `domain`.
    pub fn client_tls_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

fn missing(config: &TlsConfig) -> Option<&'static str> {
    if config.ca_cert_path.is_none() {
        Some("--ca_file")
    } else if config.cert_path.is_none() {
        Some("--cert_file")
    } else if config.key_path.is_none() {
        Some("--key_file")
    } else {
        None
    }
}

async fn read(what: &'static str, path: &Path) -> Result<Vec<u8>, TlsError> {
    if !path.exists() {
        return Err(TlsError::NotFound {
            what,
            path: path.to_path_buf(),
        });
    }
    fs::read(path).await.map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}
