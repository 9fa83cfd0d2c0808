//! Outbound transport toward the upstream.
//!
//! A pooled `hyper-util` client over `hyper-rustls`. When the upstream asks
//! for a client certificate, the resolver answers with the token credential
//! and the handshake signature is produced on the token.
//!
//! rustls does not implement TLS renegotiation, so the certificate is only
//! offered when it is requested in the initial handshake (TLS 1.3 or 1.2).
//! [`ClientIdentity::was_requested`] lets callers tell an upstream that never
//! asked for the certificate apart from one that rejected it.

use crate::error::ConfigError;
use crate::tls::crypto_provider;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{version, ClientConfig, RootCertStore, SignatureScheme};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client used for every upstream exchange; clones share the pool.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// The token credential offered to the upstream.
///
/// Clones share the request flag.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    certified: Arc<CertifiedKey>,
    requested: Arc<AtomicBool>,
}

impl ClientIdentity {
    pub fn new(certified: Arc<CertifiedKey>) -> Self {
        Self {
            certified,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether any upstream handshake has asked for the certificate so far.
    pub fn was_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/// Always presents the same token-backed certificate.
#[derive(Debug)]
struct TokenCertResolver {
    identity: ClientIdentity,
}

impl ResolvesClientCert for TokenCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        debug!("Upstream requested a client certificate");
        self.identity.requested.store(true, Ordering::Relaxed);

        let certified = &self.identity.certified;
        if certified.key.choose_scheme(sigschemes).is_none() {
            warn!(
                "Upstream accepts none of the token key's signature schemes (offered: {:?})",
                sigschemes
            );
        }
        Some(certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// rustls client configuration for the upstream.
///
/// With `identity` set, the chain and token signer are presented on request;
/// without it the client authenticates the server only.
pub fn client_tls_config(
    identity: Option<&ClientIdentity>,
    roots: RootCertStore,
) -> Result<ClientConfig, ConfigError> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])?
        .with_root_certificates(roots);

    let config = match identity {
        Some(identity) => builder.with_client_cert_resolver(Arc::new(TokenCertResolver {
            identity: identity.clone(),
        })),
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// HTTP/1.1 client for `http://` and `https://` upstreams.
pub fn build_client(tls: ClientConfig) -> UpstreamClient {
    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder(TokioExecutor::new()).build(connector)
}
