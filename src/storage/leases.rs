use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor};
use uuid::Uuid;

use super::db::{parse_opt_uuid, parse_uuid};
use crate::clock::millis_to_datetime;
use crate::error::Result;
use crate::scheduler::lease::{Lease, LeaseFilter};

const LEASE_COLUMNS: &str = "SELECT l.lease_id, l.order_id, o.batch_id, \
     o.owner_id AS order_owner_id, l.user_id, l.address, l.hostname, \
     l.created_at, l.updated_at, l.expires_at, l.done, l.failed, \
     l.failed_reason, l.metadata \
     FROM leases l JOIN orders o ON o.order_id = l.order_id";

/// Picks the oldest eligible order and leases it in one statement, so two
/// writers can never select the same order.
const HANDOUT: &str = r#"
    INSERT INTO leases
        (lease_id, order_id, user_id, address, hostname, created_at, updated_at, expires_at)
    SELECT ?1, o.order_id, ?2, ?3, ?4, ?5, ?5, ?6
    FROM orders o
    WHERE o.poisoned = 0
      AND NOT EXISTS (
          SELECT 1 FROM leases a
          WHERE a.order_id = o.order_id
            AND a.done = 0 AND a.failed = 0 AND a.expires_at > ?5)
      AND NOT EXISTS (
          SELECT 1 FROM leases d
          WHERE d.order_id = o.order_id AND d.done = 1)
    ORDER BY o.created_at, o.order_id
    LIMIT 1
    RETURNING order_id
"#;

#[derive(sqlx::FromRow)]
struct LeaseRow {
    lease_id: String,
    order_id: String,
    batch_id: Option<String>,
    order_owner_id: i64,
    user_id: i64,
    address: String,
    hostname: String,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
    done: bool,
    failed: bool,
    failed_reason: Option<String>,
    metadata: Option<Vec<u8>>,
}

impl TryFrom<LeaseRow> for Lease {
    type Error = crate::error::SchedulerError;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(Lease {
            id: parse_uuid("lease_id", &row.lease_id)?,
            order_id: parse_uuid("order_id", &row.order_id)?,
            batch_id: parse_opt_uuid("batch_id", row.batch_id)?,
            order_owner_id: row.order_owner_id,
            user_id: row.user_id,
            address: row.address,
            hostname: row.hostname,
            created_at: millis_to_datetime(row.created_at),
            updated_at: millis_to_datetime(row.updated_at),
            expires_at: millis_to_datetime(row.expires_at),
            done: row.done,
            failed: row.failed,
            failed_reason: row.failed_reason,
            metadata: row.metadata,
        })
    }
}

/// Fields recorded on a new lease.
#[derive(Debug, Clone)]
pub struct NewLease<'a> {
    pub lease_id: Uuid,
    pub user_id: i64,
    pub address: &'a str,
    pub hostname: &'a str,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Who may touch a lease: its holder, or anyone when `admin` is set.
#[derive(Debug, Clone, Copy)]
pub struct Holder {
    pub user_id: i64,
    pub admin: bool,
}

/// Position after the last row of a page; leases are listed by most recent
/// `updated_at` first.
#[derive(Debug, Clone, Copy)]
pub struct LeaseCursor {
    pub updated_at: DateTime<Utc>,
    pub lease_id: Uuid,
}

impl From<&Lease> for LeaseCursor {
    fn from(lease: &Lease) -> Self {
        Self {
            updated_at: lease.updated_at,
            lease_id: lease.id,
        }
    }
}

pub async fn fetch<'e, E: SqliteExecutor<'e>>(exec: E, lease_id: Uuid) -> Result<Option<Lease>> {
    let row: Option<LeaseRow> = sqlx::query_as(&format!("{} WHERE l.lease_id = ?", LEASE_COLUMNS))
        .bind(lease_id.to_string())
        .fetch_optional(exec)
        .await?;
    row.map(Lease::try_from).transpose()
}

/// Inserts a lease on the next eligible order. Returns the leased order id,
/// or `None` when there is nothing to hand out.
pub async fn insert_handout<'e, E: SqliteExecutor<'e>>(
    exec: E,
    lease: &NewLease<'_>,
) -> Result<Option<Uuid>> {
    let order_id: Option<String> = sqlx::query_scalar(HANDOUT)
        .bind(lease.lease_id.to_string())
        .bind(lease.user_id)
        .bind(lease.address)
        .bind(lease.hostname)
        .bind(lease.now.timestamp_millis())
        .bind(lease.expires_at.timestamp_millis())
        .fetch_optional(exec)
        .await?;
    order_id.map(|id| parse_uuid("order_id", &id)).transpose()
}

/// Pushes out the expiry of an active lease held by `holder`. Expiry never
/// moves backwards. Returns the resulting expiry, or `None` when no row
/// qualified.
pub async fn renew<'e, E: SqliteExecutor<'e>>(
    exec: E,
    lease_id: Uuid,
    holder: Holder,
    now: DateTime<Utc>,
    requested: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let expires: Option<i64> = sqlx::query_scalar(
        "UPDATE leases SET expires_at = MAX(expires_at, ?1), updated_at = ?2 \
         WHERE lease_id = ?3 AND done = 0 AND failed = 0 AND expires_at > ?2 \
           AND (user_id = ?4 OR ?5) \
         RETURNING expires_at",
    )
    .bind(requested.timestamp_millis())
    .bind(now.timestamp_millis())
    .bind(lease_id.to_string())
    .bind(holder.user_id)
    .bind(holder.admin)
    .fetch_optional(exec)
    .await?;
    Ok(expires.map(millis_to_datetime))
}

/// Marks an active lease done and stores its metadata. Returns whether a row
/// changed.
pub async fn mark_done<'e, E: SqliteExecutor<'e>>(
    exec: E,
    lease_id: Uuid,
    holder: Holder,
    now: DateTime<Utc>,
    metadata: Option<&[u8]>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE leases SET done = 1, updated_at = ?1, metadata = ?2 \
         WHERE lease_id = ?3 AND done = 0 AND failed = 0 AND expires_at > ?1 \
           AND (user_id = ?4 OR ?5)",
    )
    .bind(now.timestamp_millis())
    .bind(metadata)
    .bind(lease_id.to_string())
    .bind(holder.user_id)
    .bind(holder.admin)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Marks an active lease failed with `reason`. Returns whether a row changed.
pub async fn mark_failed<'e, E: SqliteExecutor<'e>>(
    exec: E,
    lease_id: Uuid,
    holder: Holder,
    now: DateTime<Utc>,
    reason: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE leases SET failed = 1, failed_reason = ?1, updated_at = ?2 \
         WHERE lease_id = ?3 AND done = 0 AND failed = 0 AND expires_at > ?2 \
           AND (user_id = ?4 OR ?5)",
    )
    .bind(reason)
    .bind(now.timestamp_millis())
    .bind(lease_id.to_string())
    .bind(holder.user_id)
    .bind(holder.admin)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fails up to `limit` overdue leases with `reason`. Returns the orders they
/// belonged to, one entry per expired lease.
pub async fn expire_batch<'e, E: SqliteExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
    reason: &str,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let order_ids: Vec<String> = sqlx::query_scalar(
        "UPDATE leases SET failed = 1, failed_reason = ?1 \
         WHERE lease_id IN ( \
             SELECT lease_id FROM leases \
             WHERE done = 0 AND failed = 0 AND expires_at <= ?2 \
             ORDER BY expires_at LIMIT ?3) \
         RETURNING order_id",
    )
    .bind(reason)
    .bind(now.timestamp_millis())
    .bind(limit)
    .fetch_all(exec)
    .await?;
    order_ids
        .iter()
        .map(|id| parse_uuid("order_id", id))
        .collect()
}

/// Failed leases of `order_id` created at or after `since` with no later
/// non-failed lease.
pub async fn trailing_failures<'e, E: SqliteExecutor<'e>>(
    exec: E,
    order_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM leases \
         WHERE order_id = ?1 AND failed = 1 AND created_at >= ?2 \
           AND created_at > COALESCE( \
               (SELECT MAX(created_at) FROM leases WHERE order_id = ?1 AND failed = 0), -1)",
    )
    .bind(order_id.to_string())
    .bind(since.timestamp_millis())
    .fetch_one(exec)
    .await?;
    Ok(count)
}

/// One page of leases matching `filter`, most recently updated first.
pub async fn page<'e, E: SqliteExecutor<'e>>(
    exec: E,
    filter: &LeaseFilter,
    after: Option<LeaseCursor>,
    limit: i64,
) -> Result<Vec<Lease>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(LEASE_COLUMNS);
    qb.push(" WHERE 1 = 1");
    if let Some(done) = filter.done {
        qb.push(" AND l.done = ").push_bind(done);
    }
    if let Some(batch_id) = filter.batch_id {
        qb.push(" AND o.batch_id = ").push_bind(batch_id.to_string());
    }
    if let Some(since) = filter.since {
        qb.push(" AND l.updated_at >= ")
            .push_bind(since.timestamp_millis());
    }
    if let Some(user_id) = filter.visible_to {
        qb.push(" AND (l.user_id = ")
            .push_bind(user_id)
            .push(" OR o.owner_id = ")
            .push_bind(user_id)
            .push(")");
    }
    if let Some(cursor) = after {
        let ts = cursor.updated_at.timestamp_millis();
        qb.push(" AND (l.updated_at < ")
            .push_bind(ts)
            .push(" OR (l.updated_at = ")
            .push_bind(ts)
            .push(" AND l.lease_id < ")
            .push_bind(cursor.lease_id.to_string())
            .push("))");
    }
    qb.push(" ORDER BY l.updated_at DESC, l.lease_id DESC LIMIT ")
        .push_bind(limit);

    let rows: Vec<LeaseRow> = qb.build_query_as::<LeaseRow>().fetch_all(exec).await?;
    rows.into_iter().map(Lease::try_from).collect()
}
