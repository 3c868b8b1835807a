//! Thin TLS acceptor wrapper for the HTTPS ingress listener.
//!
//! Certificate acquisition and renewal are an external collaborator (spec
//! §1, §6); this module only turns already-obtained PEM material into a
//! `rustls` server config and wraps accepted sockets. The resulting config is
//! the one global singleton the design notes permit (spec §9: "once-
//! initialized" is acceptable because acquiring a certificate is idempotent
//! and expensive).

use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::TunnelError;

/// Loads a cert chain + private key from PEM files and builds a reusable
/// acceptor for the HTTPS listener.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TunnelError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| TunnelError::TLSHandshakeFailed(format!("reading {}: {}", cert_path, e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TunnelError::TLSHandshakeFailed(format!("parsing {}: {}", cert_path, e)))?;
    if certs.is_empty() {
        return Err(TunnelError::TLSHandshakeFailed(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| TunnelError::TLSHandshakeFailed(format!("reading {}: {}", key_path, e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TunnelError::TLSHandshakeFailed(format!("parsing {}: {}", key_path, e)))?
        .ok_or_else(|| TunnelError::TLSHandshakeFailed(format!("no private key in {}", key_path)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::TLSHandshakeFailed(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<TlsStream<TcpStream>, TunnelError> {
    acceptor
        .accept(stream)
        .await
        .map_err(|e| TunnelError::TLSHandshakeFailed(e.to_string()))
}
