use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor};
use uuid::Uuid;

use super::db::{parse_opt_uuid, parse_uuid};
use crate::clock::millis_to_datetime;
use crate::error::Result;
use crate::scheduler::order::{Order, OrderFilter};

const ORDER_COLUMNS: &str =
    "SELECT order_id, batch_id, owner_id, definition, created_at, poisoned FROM orders";

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    batch_id: Option<String>,
    owner_id: i64,
    definition: Vec<u8>,
    created_at: i64,
    poisoned: bool,
}

impl TryFrom<OrderRow> for Order {
    type Error = crate::error::SchedulerError;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Order {
            id: parse_uuid("order_id", &row.order_id)?,
            batch_id: parse_opt_uuid("batch_id", row.batch_id)?,
            owner_id: row.owner_id,
            definition: row.definition,
            created_at: millis_to_datetime(row.created_at),
            poisoned: row.poisoned,
        })
    }
}

/// Position after the last row of a page; orders are listed newest first.
#[derive(Debug, Clone, Copy)]
pub struct OrderCursor {
    pub created_at: DateTime<Utc>,
    pub order_id: Uuid,
}

impl From<&Order> for OrderCursor {
    fn from(order: &Order) -> Self {
        Self {
            created_at: order.created_at,
            order_id: order.id,
        }
    }
}

pub async fn insert<'e, E: SqliteExecutor<'e>>(exec: E, order: &Order) -> Result<()> {
    sqlx::query(
        "INSERT INTO orders (order_id, batch_id, owner_id, definition, created_at, poisoned) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(order.id.to_string())
    .bind(order.batch_id.map(|b| b.to_string()))
    .bind(order.owner_id)
    .bind(&order.definition)
    .bind(order.created_at.timestamp_millis())
    .bind(order.poisoned)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn fetch<'e, E: SqliteExecutor<'e>>(exec: E, order_id: Uuid) -> Result<Option<Order>> {
    let row: Option<OrderRow> = sqlx::query_as(&format!("{} WHERE order_id = ?", ORDER_COLUMNS))
        .bind(order_id.to_string())
        .fetch_optional(exec)
        .await?;
    row.map(Order::try_from).transpose()
}

/// Looks up several orders at once. Unknown ids are skipped; the result is
/// in no particular order.
pub async fn fetch_many<'e, E: SqliteExecutor<'e>>(exec: E, ids: &[Uuid]) -> Result<Vec<Order>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ORDER_COLUMNS);
    qb.push(" WHERE order_id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.to_string());
    }
    sep.push_unseparated(")");

    let rows: Vec<OrderRow> = qb.build_query_as::<OrderRow>().fetch_all(exec).await?;
    rows.into_iter().map(Order::try_from).collect()
}

pub async fn definition<'e, E: SqliteExecutor<'e>>(exec: E, order_id: Uuid) -> Result<Vec<u8>> {
    let definition: Vec<u8> = sqlx::query_scalar("SELECT definition FROM orders WHERE order_id = ?")
        .bind(order_id.to_string())
        .fetch_one(exec)
        .await?;
    Ok(definition)
}

/// One page of orders matching `filter`, newest `created_at` first.
pub async fn page<'e, E: SqliteExecutor<'e>>(
    exec: E,
    filter: &OrderFilter,
    after: Option<OrderCursor>,
    limit: i64,
) -> Result<Vec<Order>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ORDER_COLUMNS);
    qb.push(" WHERE 1 = 1");
    if let Some(batch_id) = filter.batch_id {
        qb.push(" AND batch_id = ").push_bind(batch_id.to_string());
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ")
            .push_bind(since.timestamp_millis());
    }
    if let Some(owner_id) = filter.owner_id {
        qb.push(" AND owner_id = ").push_bind(owner_id);
    }
    if let Some(cursor) = after {
        let ts = cursor.created_at.timestamp_millis();
        qb.push(" AND (created_at < ")
            .push_bind(ts)
            .push(" OR (created_at = ")
            .push_bind(ts)
            .push(" AND order_id < ")
            .push_bind(cursor.order_id.to_string())
            .push("))");
    }
    qb.push(" ORDER BY created_at DESC, order_id DESC LIMIT ")
        .push_bind(limit);

    let rows: Vec<OrderRow> = qb.build_query_as::<OrderRow>().fetch_all(exec).await?;
    rows.into_iter().map(Order::try_from).collect()
}

/// Marks an order poisoned. Returns whether the flag changed.
pub async fn set_poisoned<'e, E: SqliteExecutor<'e>>(exec: E, order_id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE orders SET poisoned = 1 WHERE order_id = ? AND poisoned = 0")
        .bind(order_id.to_string())
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}
