//! PEM loading and rustls configuration for both TLS roles.

use crate::config::ListenerTls;
use crate::error::ConfigError;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{version, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(default_provider())
}

fn pem_error(path: &Path, reason: impl ToString) -> ConfigError {
    ConfigError::Pem {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| pem_error(path, e))
}

/// Load every certificate in a PEM file.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(pem_error(path, "no certificate found"));
    }
    Ok(certs)
}

/// Load the first private key found in `path` (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| pem_error(path, e))?
        .ok_or_else(|| pem_error(path, "no private key found (tried PKCS#8, PKCS#1, SEC1)"))
}

/// Server configuration for the TLS-terminated front end.
///
/// TLS 1.3 and 1.2, advertising `http/1.1` only.
pub fn listener_server_config(tls: &ListenerTls) -> Result<ServerConfig, ConfigError> {
    let certs = load_cert_chain(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Mozilla roots plus any CA certificates from `extra_ca`.
pub fn upstream_root_store(extra_ca: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_ca {
        for cert in load_cert_chain(path)? {
            roots.add(cert).map_err(|e| pem_error(path, e))?;
        }
    }

    Ok(roots)
}
