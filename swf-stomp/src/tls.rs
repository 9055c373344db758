//! TLS for broker connections

use crate::error::{BusError, Result};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

/// How to verify the broker's certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted CAs; the platform roots are used when unset
    pub ca_certs: Option<PathBuf>,
}

impl TlsSettings {
    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.ca_certs {
            Some(path) => {
                for cert in read_pem_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        BusError::validation(format!(
                            "Invalid SSL CA certificate in {}: {e}",
                            path.display()
                        ))
                    })?;
                }
                debug!(path = %path.display(), count = roots.len(), "Loaded SSL CA certificates");
            }
            None => {
                let native = rustls_native_certs::load_native_certs();
                for err in &native.errors {
                    warn!(error = %err, "Platform certificate load error");
                }
                let (added, ignored) = roots.add_parsable_certificates(native.certs);
                debug!(added, ignored, "Loaded platform root certificates");
            }
        }
        if roots.is_empty() {
            return Err(BusError::validation(
                "No trusted SSL CA certificates available",
            ));
        }
        Ok(roots)
    }

    /// Client configuration using the ring provider
    pub fn client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| BusError::validation(format!("SSL configuration failed: {e}")))?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();
        Ok(config)
    }

    /// Run the TLS handshake over an open TCP stream.
    pub(crate) async fn wrap(&self, host: &str, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(Arc::new(self.client_config()?));
        let server_name = ServerName::try_from(host.to_owned()).map_err(|e| {
            BusError::validation(format!("Invalid broker host name '{host}' for SSL: {e}"))
        })?;
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| BusError::transport(format!("SSL handshake with {host} failed: {e}")))
    }
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        BusError::validation(format!(
            "Cannot open SSL CA certificate file {}: {e}",
            path.display()
        ))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            BusError::validation(format!(
                "Cannot parse SSL CA certificate file {}: {e}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_file_is_a_validation_error() {
        let settings = TlsSettings {
            ca_certs: Some(PathBuf::from("/nonexistent/swf-ca.pem")),
        };
        let err = settings.client_config().expect_err("no such file");
        assert!(matches!(err, BusError::Validation(_)), "{err}");
        assert!(err.to_string().contains("swf-ca.pem"));
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").expect("write");
        let settings = TlsSettings {
            ca_certs: Some(path),
        };
        let err = settings.client_config().expect_err("nothing trusted");
        assert!(err.to_string().contains("No trusted SSL CA certificates"), "{err}");
    }

    #[test]
    fn handshake_failure_reads_as_connection_loss() {
        let err = BusError::transport("SSL handshake with broker failed: unexpected EOF");
        assert!(err.is_connection_loss());
    }
}
