use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the issuing CA certificate (PEM).
pub const ISSUER_CERT_ENV: &str = "QPOV_ISSUER_CERT";
/// Environment variable naming the issuing CA private key (PEM).
pub const ISSUER_KEY_ENV: &str = "QPOV_ISSUER_KEY";

/// TLS configuration for the RPC listener.
///
/// When complete, the server runs mutual TLS:
/// - it presents its own certificate,
/// - it requires clients to present a certificate signed by the CA,
/// - the client certificate CN is the caller's identity.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify client certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Server certificate (PEM).
    pub cert_path: Option<PathBuf>,

    /// Server private key (PEM). Must match the certificate.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// All three files are configured.
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path.is_some() && self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Some, but not all, files are configured.
    pub fn is_partial(&self) -> bool {
        !self.is_complete()
            && (self.ca_cert_path.is_some() || self.cert_path.is_some() || self.key_path.is_some())
    }
}

/// OIDC identity-token verification settings.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// URL of the issuer's JSON Web Key Set.
    pub key_url: String,
    /// Expected `aud` claim.
    pub client_id: String,
    /// Accepted `iss` claims.
    pub issuers: Vec<String>,
    /// Key set older than this is refetched on next use.
    pub key_refresh: Duration,
    /// Floor between two key set fetches, however many tokens name an
    /// unknown key.
    pub key_min_refetch: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            key_url: "https://www.googleapis.com/oauth2/v3/certs".to_string(),
            client_id: String::new(),
            issuers: vec![
                "accounts.google.com".to_string(),
                "https://accounts.google.com".to_string(),
            ],
            key_refresh: Duration::from_secs(3600),
            key_min_refetch: Duration::from_secs(30),
        }
    }
}

/// Lease timing and reaper settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lifetime of a freshly handed-out lease.
    pub default_lease: Duration,
    /// Largest extension a single Renew may grant.
    pub max_extend: Duration,
    pub reaper_period: Duration,
    /// Maximum leases expired per reaper tick.
    pub reaper_batch: i64,
    /// Consecutive failed leases that poison an order. 0 disables.
    pub poison_threshold: i64,
    /// Failures older than this don't count towards poisoning.
    pub poison_window: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(60),
            max_extend: Duration::from_secs(60 * 60),
            reaper_period: Duration::from_secs(10),
            reaper_batch: 1000,
            poison_threshold: 5,
            poison_window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Issuing CA for worker client certificates.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub validity_days: i64,
}

impl IssuerConfig {
    /// Reads the CA locations from the secret-store environment variables.
    /// Returns `None` unless both are set.
    pub fn from_env() -> Option<Self> {
        let cert = std::env::var_os(ISSUER_CERT_ENV)?;
        let key = std::env::var_os(ISSUER_KEY_ENV)?;
        Some(Self {
            ca_cert_path: PathBuf::from(cert),
            ca_key_path: PathBuf::from(key),
            validity_days: 7,
        })
    }
}

/// Per-RPC deadlines applied when the client doesn't send a tighter one.
#[derive(Debug, Clone)]
pub struct Deadlines {
    /// Page-rendering reads from the UI.
    pub ui: Duration,
    /// Worker RPCs and session management.
    pub worker: Duration,
    /// Whole-stream limit for Leases, Orders and Result.
    pub stream: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            ui: Duration::from_secs(1),
            worker: Duration::from_secs(60),
            stream: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// sqlx connection string, e.g. `sqlite:///var/lib/qpov/scheduler.db`.
    pub db_url: String,
    pub db_max_connections: u32,
    /// Blob store root: `file:///path`, `memory:///`, `s3://bucket/prefix`,
    /// or a bare local path.
    pub blob_root: String,
    /// Binary audit log. `None` disables it.
    pub rpclog_path: Option<PathBuf>,
    /// How long Stats results are reused.
    pub stats_ttl: Duration,
    /// How long in-flight RPCs may run after a shutdown signal.
    pub shutdown_grace: Duration,
    pub deadlines: Deadlines,
    pub tls: TlsConfig,
    pub oidc: OidcConfig,
    pub lease: LeaseConfig,
    pub session: SessionConfig,
    pub issuer: Option<IssuerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            db_url: "sqlite://qpov-scheduler.db".to_string(),
            db_max_connections: default_pool_size(),
            blob_root: "file:///var/lib/qpov/results".to_string(),
            rpclog_path: None,
            stats_ttl: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            deadlines: Deadlines::default(),
            tls: TlsConfig::default(),
            oidc: OidcConfig::default(),
            lease: LeaseConfig::default(),
            session: SessionConfig::default(),
            issuer: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, db_url: impl Into<String>) -> Self {
        Self {
            listen_addr,
            db_url: db_url.into(),
            ..Default::default()
        }
    }

    pub fn with_blob_root(mut self, blob_root: impl Into<String>) -> Self {
        self.blob_root = blob_root.into();
        self
    }
}

/// Four connections per core.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 4) as u32
}

/// Splits a comma-separated flag value, dropping empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
