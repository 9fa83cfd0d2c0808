use clap::ValueHint;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_CERTIFICATE_INDEX: usize = 0;

#[derive(Parser, Debug)]
#[command(name = "hsm-proxy", author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub token: TokenArgs,

    #[command(flatten)]
    pub proxy: ProxyArgs,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print the certificates on the token that have a matching private key, then exit
    ListCertificates,
}

/// Hardware token access
#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
    /// Path to the PKCS#11 module. Use the card vendor's module, or the default
    /// shown by 'pkcs11-tool --help' under '--module'.
    #[arg(long, env = "HSM_PROXY_PKCS11_PATH", value_hint = ValueHint::FilePath)]
    pub pkcs11_path: PathBuf,

    /// Serial number of the token. Run 'pkcs11-tool --list-token-slots' to find it.
    #[arg(long, env = "HSM_PROXY_TOKEN_SERIAL")]
    pub token_serial: String,

    /// Index of the certificate to use. Run 'hsm-proxy ... list-certificates' to find it.
    #[arg(
        long,
        env = "HSM_PROXY_CERTIFICATE_INDEX",
        default_value_t = DEFAULT_CERTIFICATE_INDEX
    )]
    pub certificate_index: usize,

    /// PIN to access the token. Cannot be used with --pin-file.
    #[arg(long, env = "HSM_PROXY_PIN", hide_env_values = true)]
    pub pin: Option<String>,

    /// File containing the PIN (deleted after it is read). Cannot be used with --pin.
    #[arg(long, env = "HSM_PROXY_PIN_FILE", value_hint = ValueHint::FilePath)]
    pub pin_file: Option<PathBuf>,
}

/// Forwarding and listener settings
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// URL to forward requests to.
    #[arg(long, env = "HSM_PROXY_DESTINATION_URL", value_hint = ValueHint::Url)]
    pub destination_url: Option<String>,

    /// Forward the client's Host header instead of the upstream's host.
    #[arg(long)]
    pub no_preserve_host: bool,

    /// Log each request to stdout.
    #[arg(long)]
    pub log_requests: bool,

    /// Address to listen on.
    #[arg(
        long,
        env = "HSM_PROXY_LISTEN_ADDR",
        value_hint = ValueHint::Hostname,
        default_value = DEFAULT_LISTEN_ADDR
    )]
    pub listen_addr: String,

    /// Port to listen on.
    #[arg(long, env = "HSM_PROXY_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Listen on TLS instead of plain HTTP (useful if the upstream sets 'secure' cookies).
    #[arg(long)]
    pub listen_tls: bool,

    /// Certificate or chain file for the TLS listener (required with --listen-tls).
    #[arg(long, env = "HSM_PROXY_LISTEN_TLS_CERT", value_hint = ValueHint::FilePath)]
    pub listen_tls_cert: Option<PathBuf>,

    /// Private key file for the TLS listener (required with --listen-tls).
    #[arg(long, env = "HSM_PROXY_LISTEN_TLS_KEY", value_hint = ValueHint::FilePath)]
    pub listen_tls_key: Option<PathBuf>,

    /// Extra PEM CA certificates trusted when verifying the upstream server.
    #[arg(long, env = "HSM_PROXY_UPSTREAM_CA", value_hint = ValueHint::FilePath)]
    pub upstream_ca: Option<PathBuf>,
}
