use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::clock::millis_to_datetime;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub cookie: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    cookie: String,
    user_id: i64,
    expires_at: i64,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            cookie: row.cookie,
            user_id: row.user_id,
            expires_at: millis_to_datetime(row.expires_at),
        }
    }
}

pub async fn insert<'e, E: SqliteExecutor<'e>>(exec: E, session: &SessionRecord) -> Result<()> {
    sqlx::query("INSERT INTO sessions (cookie, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(&session.cookie)
        .bind(session.user_id)
        .bind(session.expires_at.timestamp_millis())
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn fetch<'e, E: SqliteExecutor<'e>>(exec: E, cookie: &str) -> Result<Option<SessionRecord>> {
    let row: Option<SessionRow> =
        sqlx::query_as("SELECT cookie, user_id, expires_at FROM sessions WHERE cookie = ?")
            .bind(cookie)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(SessionRecord::from))
}

/// Extends a live session belonging to `user_id`. Returns whether it existed.
pub async fn refresh<'e, E: SqliteExecutor<'e>>(
    exec: E,
    cookie: &str,
    user_id: i64,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sessions SET expires_at = ? WHERE cookie = ? AND user_id = ? AND expires_at > ?",
    )
    .bind(expires_at.timestamp_millis())
    .bind(cookie)
    .bind(user_id)
    .bind(now.timestamp_millis())
    .execute(exec)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete<'e, E: SqliteExecutor<'e>>(exec: E, cookie: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sessions WHERE cookie = ?")
        .bind(cookie)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Removes every session expired at `now`, returning their cookies.
pub async fn delete_expired<'e, E: SqliteExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let cookies: Vec<String> =
        sqlx::query_scalar("DELETE FROM sessions WHERE expires_at <= ? RETURNING cookie")
            .bind(now.timestamp_millis())
            .fetch_all(exec)
            .await?;
    Ok(cookies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{users, Database};
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lifecycle() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("s.db").display());
        let db = Database::connect(&url, 2).await.unwrap();
        let user = users::create(db.pool(), "sub", "e@example.com", 0).await.unwrap();
        let now = millis_to_datetime(1_700_000_000_000);

        let session = SessionRecord {
            cookie: "c1".to_string(),
            user_id: user.id,
            expires_at: now + Duration::seconds(10),
        };
        insert(db.pool(), &session).await.unwrap();
        assert_eq!(fetch(db.pool(), "c1").await.unwrap(), Some(session.clone()));

        // Only the owner can refresh.
        let later = now + Duration::days(1);
        assert!(!refresh(db.pool(), "c1", user.id + 1, now, later).await.unwrap());
        assert!(refresh(db.pool(), "c1", user.id, now, later).await.unwrap());

        assert!(delete_expired(db.pool(), now + Duration::hours(1)).await.unwrap().is_empty());
        assert_eq!(delete_expired(db.pool(), later).await.unwrap(), vec!["c1".to_string()]);
        assert!(!delete(db.pool(), "c1").await.unwrap());
    }
}
