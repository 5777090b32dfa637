//! Background expiry of overdue leases and stale sessions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::SessionStore;
use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::Result;
use crate::retry::{with_retry, DB_RETRIES};
use crate::scheduler::lease::EXPIRED_REASON;
use crate::scheduler::manager::poison_if_failing;
use crate::storage::{leases, Database};

/// What one reaper pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub poisoned: usize,
    pub sessions: usize,
}

pub struct Reaper {
    db: Database,
    clock: Arc<dyn Clock>,
    sessions: Arc<SessionStore>,
    config: LeaseConfig,
}

impl Reaper {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        sessions: Arc<SessionStore>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            db,
            clock,
            sessions,
            config,
        }
    }

    /// Runs one pass: expire at most `reaper_batch` overdue leases, check
    /// their orders for poisoning, then drop expired sessions.
    pub async fn tick(&self) -> Result<ReapReport> {
        let (expired, poisoned) =
            with_retry("reap", DB_RETRIES, || async move { self.expire().await }).await?;
        let sessions = self.sessions.reap().await?;
        Ok(ReapReport {
            expired,
            poisoned,
            sessions,
        })
    }

    async fn expire(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let order_ids =
            leases::expire_batch(&mut *tx, now, EXPIRED_REASON, self.config.reaper_batch).await?;
        let affected: BTreeSet<Uuid> = order_ids.iter().copied().collect();

        let mut poisoned = 0;
        for order_id in affected {
            if poison_if_failing(&mut tx, order_id, now, &self.config).await? {
                poisoned += 1;
            }
        }
        tx.commit().await?;
        Ok((order_ids.len(), poisoned))
    }

    /// Ticks every `reaper_period` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reaper_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            period_ms = self.config.reaper_period.as_millis() as u64,
            batch = self.config.reaper_batch,
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(report) if report != ReapReport::default() => {
                    tracing::info!(
                        expired = report.expired,
                        poisoned = report.poisoned,
                        sessions = report.sessions,
                        "Reaped"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "Reaper pass failed, will retry next tick");
                }
                Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Permissions, Principal};
    use crate::clock::ManualClock;
    use crate::scheduler::manager::LeaseManager;
    use crate::scheduler::results::ResultStore;
    use crate::storage::{users, ObjectBlobStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Database,
        clock: Arc<ManualClock>,
        sessions: Arc<SessionStore>,
        manager: LeaseManager,
        reaper: Reaper,
    }

    async fn setup(config: LeaseConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("r.db").display());
        let db = Database::connect(&url, 4).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let sessions = Arc::new(SessionStore::new(
            db.clone(),
            clock.clone(),
            Duration::from_secs(60),
        ));
        let manager = LeaseManager::new(
            db.clone(),
            ResultStore::new(Arc::new(ObjectBlobStore::in_memory())),
            clock.clone(),
            config.clone(),
        );
        let reaper = Reaper::new(db.clone(), clock.clone(), sessions.clone(), config);
        Fixture {
            _dir: dir,
            db,
            clock,
            sessions,
            manager,
            reaper,
        }
    }

    async fn principal(db: &Database, subject: &str, permissions: Permissions) -> Principal {
        let user = users::create(db.pool(), subject, "", permissions.bits())
            .await
            .unwrap();
        Principal {
            peer: user.clone(),
            user,
            cookie: None,
            address: String::new(),
            hostname: String::new(),
            request_id: String::new(),
        }
    }

    #[tokio::test]
    async fn empty_store_reaps_nothing() {
        let f = setup(LeaseConfig::default()).await;
        assert_eq!(f.reaper.tick().await.unwrap(), ReapReport::default());
    }

    #[tokio::test]
    async fn expires_overdue_leases_for_redispatch() {
        let f = setup(LeaseConfig::default()).await;
        let owner = principal(&f.db, "owner", Permissions::CAN_ADD).await;
        let worker = principal(&f.db, "worker", Permissions::CAN_RENDER).await;
        let order_id = f.manager.add(&owner, b"o".to_vec(), "").await.unwrap();
        let first = f.manager.get(&worker).await.unwrap();

        f.clock.set(first.expires_at);
        let report = f.reaper.tick().await.unwrap();
        assert_eq!(report.expired, 1);

        let lease = leases::fetch(f.db.pool(), first.lease_id)
            .await
            .unwrap()
            .unwrap();
        assert!(lease.failed);
        assert_eq!(lease.failed_reason.as_deref(), Some(EXPIRED_REASON));

        let second = f.manager.get(&worker).await.unwrap();
        assert_eq!(second.order_id, order_id);
        assert_eq!(f.reaper.tick().await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn respects_batch_limit() {
        let config = LeaseConfig {
            reaper_batch: 2,
            ..Default::default()
        };
        let f = setup(config).await;
        let owner = principal(&f.db, "owner", Permissions::CAN_ADD).await;
        let worker = principal(&f.db, "worker", Permissions::CAN_RENDER).await;
        for i in 0..3u8 {
            f.manager.add(&owner, vec![i + 1], "").await.unwrap();
            f.manager.get(&worker).await.unwrap();
        }

        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(f.reaper.tick().await.unwrap().expired, 2);
        assert_eq!(f.reaper.tick().await.unwrap().expired, 1);
    }

    #[tokio::test]
    async fn drops_expired_sessions() {
        let f = setup(LeaseConfig::default()).await;
        let user = principal(&f.db, "ui-user", Permissions::NONE).await;
        let session = f.sessions.login(user.user.id, None).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(f.reaper.tick().await.unwrap().sessions, 1);
        assert!(f.sessions.check(&session.cookie).await.is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = setup(LeaseConfig {
            reaper_period: Duration::from_millis(10),
            ..Default::default()
        })
        .await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.reaper.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
