//! Request forwarding.
//!
//! Each inbound request is retargeted at the upstream, sent over the shared
//! client and its response is streamed back after header sanitization.
//! Bodies are never buffered.

use crate::config::{ProxyConfig, Upstream};
use crate::error::ProxyError;
use crate::sanitize::sanitize_response_headers;
use crate::transport::{ClientIdentity, UpstreamClient};
use chrono::Local;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode, Version};
use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, warn};

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers scoped to a single connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to one upstream. Shared by all connections.
pub struct Forwarder {
    client: UpstreamClient,
    upstream: Upstream,
    preserve_host: bool,
    log_requests: bool,
    identity: Option<ClientIdentity>,
}

impl Forwarder {
    pub fn new(client: UpstreamClient, config: &ProxyConfig) -> Self {
        Self {
            client,
            upstream: config.upstream.clone(),
            preserve_host: config.preserve_host,
            log_requests: config.log_requests,
            identity: None,
        }
    }

    /// The identity the client's TLS config presents, used for diagnostics.
    pub fn with_client_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Serve one request. Failures become an error response for this
    /// request only.
    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if self.log_requests {
            info!(
                target: "plain",
                "{} - Request: {} {}",
                Local::now().format("%Y/%m/%d %H:%M:%S"),
                req.method(),
                req.uri()
            );
        }

        match self.forward(req, peer).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error: {}", e);
                if self.suspect_renegotiation(&e) {
                    warn!(
                        "Upstream {} closed the connection without having requested the client \
                         certificate during the TLS handshake. It may be requesting it through \
                         TLS renegotiation, which is not supported.",
                        self.upstream
                    );
                }
                error_response(&e)
            }
        }
    }

    /// An HTTPS upstream that hung up on us although no handshake so far has
    /// asked for the certificate.
    fn suspect_renegotiation(&self, error: &ProxyError) -> bool {
        let ProxyError::Upstream(error) = error else {
            return false;
        };
        let Some(identity) = &self.identity else {
            return false;
        };
        self.upstream.is_https() && !identity.was_requested() && closed_before_response(error)
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let outbound = self.outbound_request(req, peer)?;
        debug!("Forwarding {} {}", outbound.method(), outbound.uri());

        let response = self.client.request(outbound).await?;

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        sanitize_response_headers(&mut parts.headers, self.upstream.origin());

        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }

    fn outbound_request(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Request<Incoming>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.upstream.target_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;
        remove_hop_by_hop(&mut parts.headers);

        // Without a Host header the client derives one from the URI
        if self.preserve_host {
            parts
                .headers
                .insert(HOST, self.upstream.host_header().clone());
        }
        append_forwarded_for(&mut parts.headers, peer.ip());

        Ok(Request::from_parts(parts, body))
    }
}

/// Drop hop-by-hop headers, including any named in `Connection`.
fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Whether the error chain shows the peer closing an established
/// connection, as opposed to refusing it or failing the handshake.
fn closed_before_response(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(e) = e.downcast_ref::<hyper::Error>() {
            if e.is_incomplete_message() {
                return true;
            }
        }
        if let Some(e) = e.downcast_ref::<io::Error>() {
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Append the client address to `X-Forwarded-For`, folding prior values.
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = match error {
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };

    let body = Full::new(Bytes::from(format!("Proxy error: {}", error)))
        .map_err(|never| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_hop_by_hop_removed() {
        let mut headers = map(&[
            ("connection", "keep-alive, x-session-hint"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("x-session-hint", "abc"),
            ("content-type", "application/json"),
            ("authorization", "Bearer t"),
        ]);
        remove_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["authorization"], "Bearer t");
    }

    #[test]
    fn test_forwarded_for_set() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.1.2.3".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.1.2.3");
    }

    #[test]
    fn test_forwarded_for_appended() {
        let mut headers = map(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-forwarded-for", "198.51.100.2"),
        ]);
        append_forwarded_for(&mut headers, "::1".parse().unwrap());

        let values: Vec<_> = headers.get_all(&X_FORWARDED_FOR).iter().collect();
        assert_eq!(values, ["203.0.113.7, 198.51.100.2, ::1"]);
    }

    #[test]
    fn test_closed_connection_detection() {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(closed_before_response(&eof));

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(closed_before_response(&reset));

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!closed_before_response(&refused));
    }

    #[test]
    fn test_error_statuses() {
        let invalid = hyper::Uri::builder()
            .scheme("https")
            .build()
            .map(|_| ())
            .unwrap_err();
        let response = error_response(&ProxyError::InvalidRequest(invalid));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let listener = ProxyError::ListenerFatal {
            addr: "127.0.0.1:8080".into(),
            source: std::io::ErrorKind::AddrInUse.into(),
        };
        let response = error_response(&listener);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
