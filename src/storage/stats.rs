use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::error::Result;

/// Aggregate counters over orders, leases and sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct Counts {
    pub orders: i64,
    /// Orders with an active lease.
    pub active_orders: i64,
    /// Orders with a done lease.
    pub done_orders: i64,
    pub leases: i64,
    pub active_leases: i64,
    pub done_leases: i64,
    pub failed_leases: i64,
    pub poisoned_orders: i64,
    /// Unexpired sessions.
    pub sessions: i64,
}

pub async fn count<'e, E: SqliteExecutor<'e>>(exec: E, now: DateTime<Utc>) -> Result<Counts> {
    let counts: Counts = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM orders) AS orders,
            (SELECT COUNT(DISTINCT order_id) FROM leases
                WHERE done = 0 AND failed = 0 AND expires_at > ?1) AS active_orders,
            (SELECT COUNT(DISTINCT order_id) FROM leases WHERE done = 1) AS done_orders,
            (SELECT COUNT(*) FROM leases) AS leases,
            (SELECT COUNT(*) FROM leases
                WHERE done = 0 AND failed = 0 AND expires_at > ?1) AS active_leases,
            (SELECT COUNT(*) FROM leases WHERE done = 1) AS done_leases,
            (SELECT COUNT(*) FROM leases WHERE failed = 1) AS failed_leases,
            (SELECT COUNT(*) FROM orders WHERE poisoned = 1) AS poisoned_orders,
            (SELECT COUNT(*) FROM sessions WHERE expires_at > ?1) AS sessions
        "#,
    )
    .bind(now.timestamp_millis())
    .fetch_one(exec)
    .await?;
    Ok(counts)
}
