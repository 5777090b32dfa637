//! Lease lifecycle: handout, renewal, completion, failure, submission.
//!
//! All lease state lives in the database. Each operation is one short
//! transaction, retried on busy/locked conflicts. Preconditions are
//! enforced by the `WHERE` clause of the mutating statement; when it
//! touches no row the lease is re-read to explain why.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prost::Message;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::auth::{Permissions, Principal, User};
use crate::clock::{to_chrono, Clock};
use crate::config::LeaseConfig;
use crate::error::{Result, SchedulerError};
use crate::retry::{with_retry, DB_RETRIES};
use crate::scheduler::lease::{Lease, LeaseState};
use crate::scheduler::order::Order;
use crate::scheduler::parse_opt_id;
use crate::scheduler::results::{Completion, ResultStore};
use crate::storage::leases::{self, Holder, NewLease};
use crate::storage::{orders, Database};

/// A lease granted by Get.
#[derive(Debug, Clone)]
pub struct Handout {
    pub lease_id: Uuid,
    pub order_id: Uuid,
    pub definition: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Renew,
    Done,
    Failed,
}

pub struct LeaseManager {
    db: Database,
    results: ResultStore,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(
        db: Database,
        results: ResultStore,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            db,
            results,
            clock,
            config,
        }
    }

    /// Leases the oldest eligible order to the caller.
    pub async fn get(&self, principal: &Principal) -> Result<Handout> {
        principal.require(Permissions::CAN_RENDER)?;
        let handout = with_retry("get", DB_RETRIES, || async move {
            self.try_get(principal).await
        })
        .await?;
        tracing::info!(
            lease_id = %handout.lease_id,
            order_id = %handout.order_id,
            user_id = principal.user.id,
            hostname = %principal.hostname,
            "Lease handed out"
        );
        Ok(handout)
    }

    async fn try_get(&self, principal: &Principal) -> Result<Handout> {
        let now = self.clock.now();
        let new = NewLease {
            lease_id: Uuid::new_v4(),
            user_id: principal.user.id,
            address: &principal.address,
            hostname: &principal.hostname,
            now,
            expires_at: now + to_chrono(self.config.default_lease),
        };

        let mut tx = self.db.begin().await?;
        let order_id = leases::insert_handout(&mut *tx, &new)
            .await?
            .ok_or_else(|| SchedulerError::NotFound("no orders to hand out".to_string()))?;
        let definition = orders::definition(&mut *tx, order_id).await?;
        tx.commit().await?;

        Ok(Handout {
            lease_id: new.lease_id,
            order_id,
            definition,
            expires_at: new.expires_at,
        })
    }

    /// Extends an active lease by up to `max_extend`. Returns the new expiry,
    /// which is never earlier than the old one.
    pub async fn renew(
        &self,
        principal: &Principal,
        lease_id: Uuid,
        extend_sec: i64,
    ) -> Result<DateTime<Utc>> {
        principal.require(Permissions::CAN_RENDER)?;
        if extend_sec < 0 {
            return Err(SchedulerError::InvalidArgument(format!(
                "negative extension {}",
                extend_sec
            )));
        }
        let extend = to_chrono(Duration::from_secs(extend_sec as u64).min(self.config.max_extend));
        let holder = holder(&principal.user);

        let expires_at = with_retry("renew", DB_RETRIES, || async move {
            let now = self.clock.now();
            match leases::renew(self.db.pool(), lease_id, holder, now, now + extend).await? {
                Some(expires_at) => Ok(expires_at),
                None => Err(self.explain(lease_id, &principal.user, now, Verb::Renew).await),
            }
        })
        .await?;
        tracing::debug!(lease_id = %lease_id, expires_at = %expires_at, "Lease renewed");
        Ok(expires_at)
    }

    /// Stores the result blobs, then closes the lease as done.
    ///
    /// Uploads finish before the transaction starts. If they fail the lease
    /// stays active and the worker may retry.
    pub async fn done(
        &self,
        principal: &Principal,
        lease_id: Uuid,
        completion: Completion,
    ) -> Result<()> {
        principal.require(Permissions::CAN_RENDER)?;
        let user = &principal.user;

        let lease = with_retry("done_lookup", DB_RETRIES, || {
            leases::fetch(self.db.pool(), lease_id)
        })
        .await?;
        let lease = admit(lease.as_ref(), lease_id, user, self.clock.now(), Verb::Done)?;

        self.results.upload(lease, &completion).await?;

        let metadata = completion.metadata.as_ref().map(Message::encode_to_vec);
        let metadata = metadata.as_deref();
        let holder = holder(user);
        with_retry("done", DB_RETRIES, || async move {
            let now = self.clock.now();
            let mut tx = self.db.begin().await?;
            if leases::mark_done(&mut *tx, lease_id, holder, now, metadata).await? {
                tx.commit().await?;
                return Ok(());
            }
            drop(tx);
            Err(self.explain(lease_id, user, now, Verb::Done).await)
        })
        .await?;

        tracing::info!(
            lease_id = %lease_id,
            order_id = %lease.order_id,
            image_bytes = completion.image.len(),
            "Lease done"
        );
        Ok(())
    }

    /// Closes an active lease as failed and poisons its order if it keeps
    /// failing.
    pub async fn failed(&self, principal: &Principal, lease_id: Uuid, reason: &str) -> Result<()> {
        principal.require(Permissions::CAN_RENDER)?;
        let user = &principal.user;
        let holder = holder(user);

        let (order_id, poisoned) = with_retry("failed", DB_RETRIES, || async move {
            let now = self.clock.now();
            let mut tx = self.db.begin().await?;
            if !leases::mark_failed(&mut *tx, lease_id, holder, now, reason).await? {
                drop(tx);
                return Err(self.explain(lease_id, user, now, Verb::Failed).await);
            }
            let lease = leases::fetch(&mut *tx, lease_id).await?.ok_or_else(|| {
                SchedulerError::Internal(format!("lease {} vanished while failing", lease_id))
            })?;
            let poisoned = poison_if_failing(&mut tx, lease.order_id, now, &self.config).await?;
            tx.commit().await?;
            Ok((lease.order_id, poisoned))
        })
        .await?;

        tracing::info!(
            lease_id = %lease_id,
            order_id = %order_id,
            reason,
            poisoned,
            "Lease failed"
        );
        Ok(())
    }

    /// Creates an order owned by the caller.
    pub async fn add(
        &self,
        principal: &Principal,
        definition: Vec<u8>,
        batch_id: &str,
    ) -> Result<Uuid> {
        principal.require(Permissions::CAN_ADD)?;
        if definition.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "empty order definition".to_string(),
            ));
        }
        let batch_id = parse_opt_id("batch_id", batch_id)?;

        let order = Order::new(principal.user.id, definition, batch_id, self.clock.now());
        let order = &order;
        with_retry("add", DB_RETRIES, || orders::insert(self.db.pool(), order)).await?;
        tracing::info!(
            order_id = %order.id,
            batch_id = ?order.batch_id,
            owner_id = order.owner_id,
            "Order added"
        );
        Ok(order.id)
    }

    /// Works out why a conditional update on `lease_id` matched no row.
    async fn explain(
        &self,
        lease_id: Uuid,
        user: &User,
        now: DateTime<Utc>,
        verb: Verb,
    ) -> SchedulerError {
        let lease = match leases::fetch(self.db.pool(), lease_id).await {
            Ok(lease) => lease,
            Err(e) => return e,
        };
        match admit(lease.as_ref(), lease_id, user, now, verb) {
            Err(e) => e,
            // The row looked fine on re-read: it changed in between.
            Ok(_) => SchedulerError::Unavailable(format!("lease {} changed concurrently", lease_id)),
        }
    }
}

fn holder(user: &User) -> Holder {
    Holder {
        user_id: user.id,
        admin: user.is_admin(),
    }
}

/// Checks that `user` may act on `lease` and that it is still active.
fn admit<'a>(
    lease: Option<&'a Lease>,
    lease_id: Uuid,
    user: &User,
    now: DateTime<Utc>,
    verb: Verb,
) -> Result<&'a Lease> {
    let lease =
        lease.ok_or_else(|| SchedulerError::NotFound(format!("lease {}", lease_id)))?;
    if lease.user_id != user.id && !user.is_admin() {
        return Err(SchedulerError::PermissionDenied(format!(
            "lease {} belongs to user {}",
            lease_id, lease.user_id
        )));
    }
    match lease.state(now) {
        LeaseState::Active => Ok(lease),
        LeaseState::Done if verb == Verb::Done => Err(SchedulerError::AlreadyExists(format!(
            "lease {} is already done",
            lease_id
        ))),
        state => Err(SchedulerError::FailedPrecondition(format!(
            "lease {} is {}",
            lease_id, state
        ))),
    }
}

/// Marks `order_id` poisoned once its trailing failures inside the window
/// reach the threshold. Returns whether the flag was newly set.
pub(crate) async fn poison_if_failing(
    conn: &mut SqliteConnection,
    order_id: Uuid,
    now: DateTime<Utc>,
    config: &LeaseConfig,
) -> Result<bool> {
    if config.poison_threshold <= 0 {
        return Ok(false);
    }
    let since = now - to_chrono(config.poison_window);
    let failures = leases::trailing_failures(&mut *conn, order_id, since).await?;
    if failures < config.poison_threshold {
        return Ok(false);
    }
    let poisoned = orders::set_poisoned(&mut *conn, order_id).await?;
    if poisoned {
        tracing::warn!(order_id = %order_id, failures, "Order poisoned after repeated failures");
    }
    Ok(poisoned)
}
