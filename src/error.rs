//! Error types for the proxy.
//!
//! Startup errors ([`ConfigError`], [`CredentialError`]) abort the process.
//! [`ProxyError::Upstream`] is scoped to a single exchange and never reaches
//! the accept loop. [`ProxyError::ListenerFatal`] ends the process.

use std::path::PathBuf;
use thiserror::Error;

/// Missing or contradictory settings, detected before anything is served.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No upstream URL was supplied.
    #[error("destination-url is required")]
    MissingUpstream,

    /// The upstream URL could not be used as a forwarding target.
    #[error("invalid destination URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    /// TLS listening was requested without both materials.
    #[error("listen-tls-cert and listen-tls-key are both required when listen-tls is set")]
    IncompleteListenerTls,

    /// Neither `--pin` nor `--pin-file` was given.
    #[error("either pin or pin-file is required")]
    MissingPin,

    /// Both `--pin` and `--pin-file` were given.
    #[error("both pin and pin-file are set, use only one")]
    ConflictingPin,

    /// The PIN file could not be read or removed.
    #[error("PIN file {path}: {source}")]
    PinFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A PEM file for the listener or the upstream trust store was unusable.
    #[error("{path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    /// rustls rejected the assembled TLS configuration.
    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failures of the hardware credential provider.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The PKCS#11 module could not be loaded or no token has the serial.
    #[error("token unavailable: {0}")]
    TokenUnavailable(String),

    /// The token rejected the PIN.
    #[error("token rejected the PIN: {0}")]
    AuthenticationFailed(#[source] cryptoki::error::Error),

    /// Enumeration succeeded but no certificate has a matching private key.
    #[error("no certificate with a matching private key found on the token")]
    NoCredentials,

    /// The requested certificate index is past the enumerated set.
    #[error(
        "certificate index {index} is out of range, the token holds {count} usable certificate(s); \
         run 'list-certificates' to find the index"
    )]
    IndexOutOfRange { index: usize, count: usize },

    /// Any other PKCS#11 call failure.
    #[error("PKCS#11 error: {0}")]
    Token(#[from] cryptoki::error::Error),

    /// A certificate object on the token is not valid DER X.509.
    #[error("unreadable certificate on token: {0}")]
    Certificate(String),
}

/// Top-level error taxonomy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// A single upstream exchange failed (connect, handshake, signing, I/O).
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The outbound request could not be assembled from the inbound one.
    #[error("could not build upstream request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    /// Bind or accept failure; the proxy cannot continue.
    #[error("listener failed on {addr}: {source}")]
    ListenerFatal {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
