//! Inbound front end: plain TCP or TLS-terminated HTTP/1.1.

use crate::config::{ListenAddr, ListenerTls};
use crate::error::ProxyError;
use crate::forward::Forwarder;
use crate::tls::listener_server_config;
use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    addr: String,
    forwarder: Arc<Forwarder>,
}

impl Listener {
    /// Load the TLS materials (if any) and bind.
    ///
    /// Unreadable materials fail before the port is taken.
    pub async fn bind(
        listen: &ListenAddr,
        tls: Option<&ListenerTls>,
        forwarder: Arc<Forwarder>,
    ) -> Result<Listener, ProxyError> {
        let tls = tls
            .map(|tls| listener_server_config(tls).map(|config| TlsAcceptor::from(Arc::new(config))))
            .transpose()?;

        let addr = listen.to_string();
        let tcp = TcpListener::bind((listen.host.as_str(), listen.port))
            .await
            .map_err(|source| ProxyError::ListenerFatal {
                addr: addr.clone(),
                source,
            })?;

        Ok(Listener {
            tcp,
            tls,
            addr,
            forwarder,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept connections until a fatal socket error.
    ///
    /// Every connection runs on its own task. Per-connection failures,
    /// including TLS handshake errors, are logged and do not stop the loop.
    /// Resource exhaustion while accepting (out of descriptors or memory)
    /// pauses the loop with a growing delay instead of ending it.
    pub async fn serve(self) -> Result<(), ProxyError> {
        let mut backoff = AcceptBackoff::default();

        loop {
            let (stream, peer) = match self.tcp.accept().await {
                Ok(accepted) => {
                    backoff.reset();
                    accepted
                }
                Err(source) => match classify_accept_error(&source) {
                    AcceptFailure::Retry => {
                        debug!("Accept failed on {}: {}", self.addr, source);
                        continue;
                    }
                    AcceptFailure::Backoff => {
                        let delay = backoff.next_delay();
                        warn!(
                            "Accept failed on {}: {}; retrying in {:?}",
                            self.addr, source, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    AcceptFailure::Fatal => {
                        return Err(ProxyError::ListenerFatal {
                            addr: self.addr,
                            source,
                        })
                    }
                },
            };

            let tls = self.tls.clone();
            let forwarder = self.forwarder.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, tls, forwarder).await {
                    debug!("Connection error from {}: {:#}", peer, e);
                }
            });
        }
    }
}

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Tied to one pending connection; accept again right away.
    Retry,
    /// The process is short on resources; wait before accepting again.
    Backoff,
    /// The listening socket itself is unusable.
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    use io::ErrorKind::*;

    match e.kind() {
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
        | TimedOut => AcceptFailure::Retry,
        InvalidInput | PermissionDenied | NotConnected | Unsupported | AddrInUse
        | AddrNotAvailable => AcceptFailure::Fatal,
        // EMFILE, ENFILE, ENOBUFS and ENOMEM land here
        _ => AcceptFailure::Backoff,
    }
}

/// Doubling delay between failed accepts, reset by the next success.
#[derive(Debug, Default)]
struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => MIN_ACCEPT_DELAY,
            Some(previous) => (previous * 2).min(MAX_ACCEPT_DELAY),
        };
        self.delay = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    forwarder: Arc<Forwarder>,
) -> Result<()> {
    debug!("New connection from {}", peer);

    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;
            serve_http(stream, peer, forwarder).await?;
        }
        None => serve_http(stream, peer, forwarder).await?,
    }

    debug!("Connection closed from {}", peer);
    Ok(())
}

async fn serve_http<I>(io: I, peer: SocketAddr, forwarder: Arc<Forwarder>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let forwarder = forwarder.clone();
                async move { Ok::<_, Infallible>(forwarder.handle(req, peer).await) }
            }),
        )
        .await
        .context("HTTP connection error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_connection_accept_errors_retry() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(classify_accept_error(&kind.into()), AcceptFailure::Retry);
        }
    }

    #[test]
    fn test_resource_exhaustion_backs_off() {
        assert_eq!(
            classify_accept_error(&io::ErrorKind::OutOfMemory.into()),
            AcceptFailure::Backoff
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descriptor_exhaustion_backs_off() {
        // EMFILE, ENFILE, ENOBUFS
        for code in [24, 23, 105] {
            assert_eq!(
                classify_accept_error(&io::Error::from_raw_os_error(code)),
                AcceptFailure::Backoff,
                "errno {code}"
            );
        }
    }

    #[test]
    fn test_broken_socket_is_fatal() {
        assert_eq!(
            classify_accept_error(&io::ErrorKind::InvalidInput.into()),
            AcceptFailure::Fatal
        );
        assert_eq!(
            classify_accept_error(&io::ErrorKind::PermissionDenied.into()),
            AcceptFailure::Fatal
        );
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = AcceptBackoff::default();
        let delays: Vec<u128> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, [5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), MIN_ACCEPT_DELAY);
    }
}
