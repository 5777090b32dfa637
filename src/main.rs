use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qpov_scheduler::config::{
    parse_list, IssuerConfig, LeaseConfig, OidcConfig, ServerConfig, TlsConfig,
};
use qpov_scheduler::node::{Dependencies, Node};
use qpov_scheduler::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "qpov-scheduler")]
#[command(version)]
#[command(about = "Hands out POV-Ray render orders to workers under time-limited leases")]
struct Args {
    /// Address to serve gRPC on
    #[arg(long, default_value = "0.0.0.0:9999")]
    listen: SocketAddr,

    /// sqlx connection string for the order/lease database
    #[arg(long, default_value = "sqlite://qpov-scheduler.db")]
    db: String,

    /// Where rendered results are stored (file://, s3://, gs://, memory:// or a path)
    #[arg(long = "blob_root", default_value = "file:///var/lib/qpov/results")]
    blob_root: String,

    /// CA certificate (PEM) that signs client certificates
    #[arg(long = "ca_file")]
    ca_file: Option<PathBuf>,

    /// Server certificate (PEM)
    #[arg(long = "cert_file")]
    cert_file: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long = "key_file")]
    key_file: Option<PathBuf>,

    /// JSON Web Key Set used to verify identity tokens
    #[arg(long = "oidc_key_url", default_value = "https://www.googleapis.com/oauth2/v3/certs")]
    oidc_key_url: String,

    /// Expected audience of identity tokens
    #[arg(long = "oauth_client_id", default_value = "")]
    oauth_client_id: String,

    /// Accepted token issuers, comma-separated
    #[arg(
        long = "oauth_issuers",
        default_value = "accounts.google.com,https://accounts.google.com"
    )]
    oauth_issuers: String,

    /// Lifetime of a freshly handed-out lease, in seconds
    #[arg(long = "default_lease_sec", default_value = "60")]
    default_lease_sec: u64,

    /// Largest extension a single Renew may grant, in seconds
    #[arg(long = "max_extend_sec", default_value = "3600")]
    max_extend_sec: u64,

    /// Seconds between lease-expiry sweeps
    #[arg(long = "reaper_period", default_value = "10")]
    reaper_period: u64,

    /// Append a binary record of every RPC to this file
    #[arg(long)]
    rpclog: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let oidc = OidcConfig {
            key_url: self.oidc_key_url,
            client_id: self.oauth_client_id,
            issuers: parse_list(&self.oauth_issuers),
            ..OidcConfig::default()
        };
        let lease = LeaseConfig {
            default_lease: Duration::from_secs(self.default_lease_sec),
            max_extend: Duration::from_secs(self.max_extend_sec),
            reaper_period: Duration::from_secs(self.reaper_period.max(1)),
            ..LeaseConfig::default()
        };
        let tls = TlsConfig {
            ca_cert_path: self.ca_file,
            cert_path: self.cert_file,
            key_path: self.key_file,
        };

        ServerConfig {
            rpclog_path: self.rpclog,
            tls,
            oidc,
            lease,
            issuer: IssuerConfig::from_env(),
            ..ServerConfig::new(self.listen, self.db).with_blob_root(self.blob_root)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();

    if config.tls.is_partial() {
        return Err("TLS needs --ca_file, --cert_file and --key_file together".into());
    }
    if !config.tls.is_complete() {
        tracing::warn!(
            "Running without TLS: callers have no identity and every RPC will be rejected"
        );
    }
    if config.oidc.client_id.is_empty() {
        tracing::warn!("--oauth_client_id is empty; Login will reject every token");
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        db = %config.db_url,
        blob_root = %config.blob_root,
        tls = config.tls.is_complete(),
        rpclog = ?config.rpclog_path,
        default_lease_sec = config.lease.default_lease.as_secs(),
        max_extend_sec = config.lease.max_extend.as_secs(),
        "Starting qpov scheduler"
    );

    let shutdown = install_shutdown_handler()?;
    let deps = Dependencies::from_config(&config).await?;
    Node::new(config, deps).run(shutdown).await?;
    Ok(())
}
