use crate::args::{Cli, Command};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forward::Forwarder;
use crate::listener::Listener;
use crate::tls::upstream_root_store;
use crate::token::{TokenConfig, TokenSession};
use crate::transport::{build_client, client_tls_config, ClientIdentity};
use chrono::Local;
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub enum Application {
    ListCertificates(TokenConfig),
    Serve {
        token: TokenConfig,
        certificate_index: usize,
        proxy: ProxyConfig,
    },
}

impl Application {
    pub fn init() -> anyhow::Result<Application> {
        let cli = Cli::parse();
        Ok(Application::from_cli(cli)?)
    }

    /// Validate the command line. Proxy settings are checked before the PIN
    /// is resolved, so a rejected invocation leaves a PIN file in place.
    pub fn from_cli(cli: Cli) -> Result<Application, ProxyError> {
        let application = match cli.cmd {
            Some(Command::ListCertificates) => {
                Application::ListCertificates(TokenConfig::setup(&cli.token)?)
            }
            None => {
                let proxy = ProxyConfig::setup(&cli.proxy)?;
                Application::Serve {
                    token: TokenConfig::setup(&cli.token)?,
                    certificate_index: cli.token.certificate_index,
                    proxy,
                }
            }
        };

        Ok(application)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        match self {
            Self::ListCertificates(token) => list_certificates(&token),
            Self::Serve {
                token,
                certificate_index,
                proxy,
            } => {
                let session = TokenSession::open(&token)?;
                let outcome = serve(&session, certificate_index, &proxy).await;
                if let Err(e) = session.close() {
                    warn!("Failed to close token session: {}", e);
                }
                outcome
            }
        }
    }
}

fn list_certificates(token: &TokenConfig) -> Result<(), ProxyError> {
    let session = TokenSession::open(token)?;

    for credential in session.credentials() {
        info!(
            target: "plain",
            "Certificate index {}: {}",
            credential.index(),
            credential.subject()
        );
        debug!(
            "  label '{}', id {}, {} key",
            credential.label(),
            credential.id_hex(),
            credential.key_kind()
        );
    }

    session.close()?;
    Ok(())
}

async fn serve(
    session: &TokenSession,
    certificate_index: usize,
    proxy: &ProxyConfig,
) -> Result<(), ProxyError> {
    let credential = session.select(certificate_index)?;
    info!(
        "Using certificate index {}: {} ({} key)",
        credential.index(),
        credential.subject(),
        credential.key_kind()
    );

    let roots = upstream_root_store(proxy.upstream_ca.as_deref())?;
    let identity = ClientIdentity::new(credential.certified_key());
    let tls = client_tls_config(Some(&identity), roots)?;
    let forwarder =
        Arc::new(Forwarder::new(build_client(tls), proxy).with_client_identity(identity));

    let listener = Listener::bind(&proxy.listen, proxy.listener_tls.as_ref(), forwarder).await?;
    let scheme = if listener.is_tls() { "https" } else { "http" };
    info!(
        target: "plain",
        "{} - Listening on {}://{}, forwarding to {}",
        Local::now().format("%Y/%m/%d %H:%M:%S"),
        scheme,
        proxy.listen,
        proxy.upstream
    );

    tokio::select! {
        result = listener.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::fs;
    use temp_dir::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec![
            "hsm-proxy",
            "--pkcs11-path",
            "/usr/lib/opensc-pkcs11.so",
            "--token-serial",
            "0123",
        ];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_list_mode_needs_no_destination() {
        let app = Application::from_cli(cli(&["--pin", "1234", "list-certificates"])).unwrap();
        assert!(matches!(app, Application::ListCertificates(_)));
    }

    #[test]
    fn test_serve_mode() {
        let app = Application::from_cli(cli(&[
            "--pin",
            "1234",
            "--certificate-index",
            "2",
            "--destination-url",
            "https://backend.example",
        ]))
        .unwrap();

        let Application::Serve {
            certificate_index,
            proxy,
            ..
        } = app
        else {
            panic!("expected serve mode");
        };
        assert_eq!(certificate_index, 2);
        assert_eq!(proxy.upstream.origin(), "https://backend.example");
    }

    #[test]
    fn test_missing_pin() {
        let err = Application::from_cli(cli(&["--destination-url", "https://backend.example"]))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProxyError::Configuration(ConfigError::MissingPin)
        ));
    }

    #[test]
    fn test_invalid_proxy_settings_keep_pin_file() {
        let dir = TempDir::new().unwrap();
        let pin_file = dir.child("pin");
        fs::write(&pin_file, "1234\n").unwrap();

        let err = Application::from_cli(cli(&[
            "--pin-file",
            pin_file.to_str().unwrap(),
            "--destination-url",
            "https://backend.example",
            "--listen-tls",
        ]))
        .err()
        .unwrap();

        assert!(matches!(
            err,
            ProxyError::Configuration(ConfigError::IncompleteListenerTls)
        ));
        assert!(pin_file.exists());
    }
}
