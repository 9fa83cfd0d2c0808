//! Reverse proxy that authenticates to its upstream with a hardware token.
//!
//! Clients speak plain HTTP (or TLS with a local certificate) to the proxy.
//! The proxy forwards every request to a single upstream over HTTPS and,
//! when the upstream asks for a client certificate, presents one stored on a
//! PKCS#11 token. The private key never leaves the token.
//!
//! ## Flow
//!
//! ```text
//! 1. Resolve the PIN, log in to the token, enumerate paired certificates
//! 2. Select the credential by index and build the upstream TLS client
//! 3. Bind the listener and accept connections
//! 4. For each request: rewrite target and Host, forward, stream back
//! 5. Rewrite Location and Set-Cookie so the client stays on the proxy
//! ```

pub mod app;
pub mod args;
pub mod config;
pub mod error;
pub mod forward;
pub mod listener;
pub mod pin;
pub mod sanitize;
pub mod tls;
pub mod token;
pub mod transport;

pub use app::Application;
pub use config::{ListenAddr, ListenerTls, ProxyConfig, Upstream};
pub use error::{ConfigError, CredentialError, ProxyError};
pub use forward::{Forwarder, ProxyBody};
pub use listener::Listener;
pub use token::{Credential, TokenConfig, TokenSession};
pub use transport::{build_client, client_tls_config, ClientIdentity, UpstreamClient};
