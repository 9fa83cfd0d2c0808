use crate::args::ProxyArgs;
use crate::error::ConfigError;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

mod upstream;

pub use upstream::Upstream;

/// Certificate and key for a TLS-terminated front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerTls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ListenerTls {
    /// Resolve the `--listen-tls*` flags. Both paths must be present when TLS
    /// is enabled.
    pub fn from_flags(
        enabled: bool,
        cert_path: Option<PathBuf>,
        key_path: Option<PathBuf>,
    ) -> Result<Option<Self>, ConfigError> {
        if !enabled {
            if cert_path.is_some() || key_path.is_some() {
                warn!("listen-tls is not set; ignoring listener certificate and key");
            }
            return Ok(None);
        }

        match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => Ok(Some(Self {
                cert_path,
                key_path,
            })),
            _ => Err(ConfigError::IncompleteListenerTls),
        }
    }
}

/// Where the front end listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Validated settings driving the forwarding engine and the listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream: Upstream,
    /// Send the upstream's host as `Host` instead of the client's.
    pub preserve_host: bool,
    pub log_requests: bool,
    pub listen: ListenAddr,
    pub listener_tls: Option<ListenerTls>,
    /// Extra trust anchors for the upstream server certificate.
    pub upstream_ca: Option<PathBuf>,
}

impl ProxyConfig {
    /// Build and validate the config. Nothing is opened or bound here.
    pub fn setup(args: &ProxyArgs) -> Result<ProxyConfig, ConfigError> {
        let destination = args
            .destination_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingUpstream)?;
        let upstream = Upstream::parse(destination)?;

        let listener_tls = ListenerTls::from_flags(
            args.listen_tls,
            args.listen_tls_cert.clone(),
            args.listen_tls_key.clone(),
        )?;

        Ok(ProxyConfig {
            upstream,
            preserve_host: !args.no_preserve_host,
            log_requests: args.log_requests,
            listen: ListenAddr {
                host: args.listen_addr.clone(),
                port: args.listen_port,
            },
            listener_tls,
            upstream_ca: args.upstream_ca.clone(),
        })
    }
}
