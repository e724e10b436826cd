//! TLS acceptor setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;

use crate::ServerError;

pub(crate) const HTTP11: &[u8] = b"http/1.1";

/// Where the server's TLS configuration comes from.
#[derive(Debug, Clone)]
pub enum TlsSource {
    /// PEM encoded certificate chain and private key files, with extra ALPN identifiers.
    Pem { cert: PathBuf, key: PathBuf, alpn: Vec<Vec<u8>> },
    /// A ready rustls configuration.
    Config(Arc<ServerConfig>),
}

impl TlsSource {
    /// Builds the acceptor. `http/1.1` is always advertised through ALPN.
    pub(crate) fn acceptor(&self) -> Result<TlsAcceptor, ServerError> {
        let config = match self {
            TlsSource::Pem { cert, key, alpn } => {
                let cert_pem = read(cert)?;
                let key_pem = read(key)?;
                server_config(&cert_pem, &key_pem, alpn.clone())?
            }
            TlsSource::Config(config) => {
                let mut config = ServerConfig::clone(config);
                ensure_http11(&mut config.alpn_protocols);
                config
            }
        };
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Builds a server configuration from PEM bytes.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8], mut alpn: Vec<Vec<u8>>) -> Result<ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut &*cert_pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::config("no certificate found in pem data"));
    }
    let key = rustls_pemfile::private_key(&mut &*key_pem)?
        .ok_or_else(|| ServerError::config("no private key found in pem data"))?;

    let mut config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?;
    ensure_http11(&mut alpn);
    config.alpn_protocols = alpn;
    Ok(config)
}

fn read(path: &Path) -> Result<Vec<u8>, ServerError> {
    std::fs::read(path).map_err(|source| ServerError::TlsFile { path: path.to_path_buf(), source })
}

fn ensure_http11(alpn: &mut Vec<Vec<u8>>) {
    if !alpn.iter().any(|proto| proto == HTTP11) {
        alpn.push(HTTP11.to_vec());
    }
}
