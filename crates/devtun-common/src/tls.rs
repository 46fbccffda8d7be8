use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::io::Cursor;
use std::path::Path;

use crate::TunnelError;

/// The tunnel handshake is a plain HTTP/1.1 upgrade
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Load certificates from PEM content string
fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))
}

/// Load a root certificate store from PEM content string
fn load_root_store_from_pem(pem_content: &str) -> Result<RootCertStore, TunnelError> {
    let ca_certs = load_certs_from_pem(pem_content)?;
    if ca_certs.is_empty() {
        return Err(TunnelError::Certificate(
            "No certificates found in CA bundle".to_string(),
        ));
    }

    let mut root_store = RootCertStore::empty();
    for cert in ca_certs {
        root_store.add(cert).map_err(|e| {
            TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

fn client_config_with_roots(root_store: RootCertStore) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    config
}

/// Client TLS config trusting only the CA bundle in `ca_pem`
pub fn load_client_config_from_pem(ca_pem: &str) -> Result<ClientConfig, TunnelError> {
    let root_store = load_root_store_from_pem(ca_pem)?;
    Ok(client_config_with_roots(root_store))
}

/// Client TLS config trusting only the CA bundle stored at `ca_path`
pub fn load_client_config(ca_path: &Path) -> Result<ClientConfig, TunnelError> {
    let pem = std::fs::read_to_string(ca_path)?;
    load_client_config_from_pem(&pem)
}

/// Client TLS config trusting the Mozilla root program
pub fn load_webpki_client_config() -> ClientConfig {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    tracing::debug!(
        "Using {} bundled web PKI roots for access point TLS",
        root_store.len()
    );
    client_config_with_roots(root_store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_empty_ca_bundle_is_rejected() {
        install_provider();
        let result = load_client_config_from_pem("not a certificate");
        assert!(matches!(result, Err(TunnelError::Certificate(_))));
    }

    #[test]
    fn test_missing_ca_file() {
        install_provider();
        let result = load_client_config(Path::new("/nonexistent/devtun-ca.pem"));
        assert!(matches!(result, Err(TunnelError::Io(_))));
    }

    #[test]
    fn test_webpki_config_speaks_http1() {
        install_provider();
        let config = load_webpki_client_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
