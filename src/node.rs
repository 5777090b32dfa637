use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, CertIssuer, HttpKeySource, KeySource, SessionStore, TokenVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::SchedulerError;
use crate::grpc::{CookieService, GrpcServer, RpcContext, SchedulerService};
use crate::rpclog::RpcLog;
use crate::scheduler::{Introspector, LeaseManager, Reaper, ResultStore, StatsCache};
use crate::storage::{BlobStore, Database, ObjectBlobStore};
use crate::tls::{TlsError, TlsIdentity};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("storage: {0}")]
    Storage(#[from] SchedulerError),

    #[error("tls: {0}")]
    Tls(#[from] TlsError),

    #[error("rpc log: {0}")]
    RpcLog(#[source] std::io::Error),

    #[error("bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Everything the scheduler talks to outside its own process.
pub struct Dependencies {
    pub db: Database,
    pub blobs: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
    pub keys: Arc<dyn KeySource>,
    pub issuer: Option<Arc<CertIssuer>>,
    pub rpclog: Option<Arc<RpcLog>>,
    pub tls: Option<TlsIdentity>,
}

impl Dependencies {
    /// Opens the database, blob store, audit log and key material named by
    /// `config`.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, NodeError> {
        let tls = TlsIdentity::load(&config.tls).await?;
        let db = Database::connect(&config.db_url, config.db_max_connections).await?;
        let blobs: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::from_url(&config.blob_root)?);

        let issuer = match &config.issuer {
            Some(issuer) => Some(Arc::new(CertIssuer::load(issuer).await?)),
            None => {
                tracing::info!("No issuing CA configured; Certificate is disabled");
                None
            }
        };
        let rpclog = match &config.rpclog_path {
            Some(path) => Some(Arc::new(RpcLog::open(path).await.map_err(NodeError::RpcLog)?)),
            None => None,
        };

        Ok(Self {
            db,
            blobs,
            clock: Arc::new(SystemClock),
            keys: Arc::new(HttpKeySource::new(config.oidc.key_url.clone())),
            issuer,
            rpclog,
            tls,
        })
    }

    /// Wires the services and the reaper over these dependencies.
    pub fn assemble(self, config: &ServerConfig) -> Services {
        let Dependencies {
            db,
            blobs,
            clock,
            keys,
            issuer,
            rpclog,
            tls,
        } = self;

        let sessions = Arc::new(SessionStore::new(db.clone(), clock.clone(), config.session.ttl));
        let auth = Arc::new(Authenticator::new(db.clone(), sessions.clone()));
        let ctx = RpcContext::new(auth, rpclog);
        let results = ResultStore::new(blobs);

        let manager = Arc::new(LeaseManager::new(
            db.clone(),
            results.clone(),
            clock.clone(),
            config.lease.clone(),
        ));
        let introspector = Arc::new(Introspector::new(db.clone(), results));
        let stats = Arc::new(StatsCache::new(db.clone(), clock.clone(), config.stats_ttl));
        let verifier = Arc::new(TokenVerifier::new(keys, &config.oidc));

        Services {
            scheduler: SchedulerService::new(
                ctx.clone(),
                config.deadlines.clone(),
                manager,
                introspector,
                stats,
                issuer,
                clock.clone(),
            ),
            cookies: CookieService::new(
                ctx,
                config.deadlines.clone(),
                db.clone(),
                verifier,
                sessions.clone(),
            ),
            reaper: Reaper::new(db.clone(), clock, sessions, config.lease.clone()),
            tls,
            db,
        }
    }
}

pub struct Services {
    pub scheduler: SchedulerService,
    pub cookies: CookieService,
    pub reaper: Reaper,
    pub tls: Option<TlsIdentity>,
    pub db: Database,
}

/// A running scheduler: the RPC listener plus the background reaper.
pub struct Node {
    config: ServerConfig,
    services: Services,
}

impl Node {
    pub fn new(config: ServerConfig, deps: Dependencies) -> Self {
        let services = deps.assemble(&config);
        Self { config, services }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(NodeError::Bind)?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serves until `shutdown` fires, then gives in-flight RPCs up to
    /// `shutdown_grace` before closing the database.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), NodeError> {
        let Node { config, services } = self;
        let Services {
            scheduler,
            cookies,
            reaper,
            tls,
            db,
        } = services;

        let stop_reaper = shutdown.child_token();
        let reaper_task = tokio::spawn(reaper.run(stop_reaper.clone()));

        let serve = GrpcServer::new(tls, scheduler, cookies).serve(listener, shutdown.clone());
        tokio::pin!(serve);

        let result = tokio::select! {
            result = &mut serve => result,
            _ = shutdown.cancelled() => {
                match tokio::time::timeout(config.shutdown_grace, &mut serve).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            grace_ms = config.shutdown_grace.as_millis() as u64,
                            "In-flight RPCs still running after grace period, abandoning them"
                        );
                        Ok(())
                    }
                }
            }
        };

        stop_reaper.cancel();
        if let Err(e) = reaper_task.await {
            tracing::error!(error = %e, "Reaper task panicked");
        }
        db.close().await;
        tracing::info!("Scheduler stopped");
        result.map_err(NodeError::from)
    }
}
