use sqlx::SqliteExecutor;

use crate::auth::user::{Permissions, User};
use crate::error::Result;

const USER_COLUMNS: &str = "user_id, oauth_subject, email, permissions";

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    oauth_subject: String,
    email: String,
    permissions: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.user_id,
            subject: row.oauth_subject,
            email: row.email,
            permissions: Permissions::from_bits(row.permissions as u32),
        }
    }
}

pub async fn by_subject<'e, E: SqliteExecutor<'e>>(exec: E, subject: &str) -> Result<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE oauth_subject = ?",
        USER_COLUMNS
    ))
    .bind(subject)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(User::from))
}

pub async fn by_id<'e, E: SqliteExecutor<'e>>(exec: E, user_id: i64) -> Result<Option<User>> {
    let row: Option<UserRow> =
        sqlx::query_as(&format!("SELECT {} FROM users WHERE user_id = ?", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(exec)
            .await?;
    Ok(row.map(User::from))
}

/// Creates the user on first login, otherwise refreshes its email.
/// Permissions of an existing user are left alone; new users get none.
pub async fn upsert_login<'e, E: SqliteExecutor<'e>>(
    exec: E,
    subject: &str,
    email: &str,
) -> Result<User> {
    let row: UserRow = sqlx::query_as(&format!(
        "INSERT INTO users (oauth_subject, email) VALUES (?, ?) \
         ON CONFLICT(oauth_subject) DO UPDATE SET email = excluded.email \
         RETURNING {}",
        USER_COLUMNS
    ))
    .bind(subject)
    .bind(email)
    .fetch_one(exec)
    .await?;
    Ok(row.into())
}

/// Provisioning helper for operators and tests.
pub async fn create<'e, E: SqliteExecutor<'e>>(
    exec: E,
    subject: &str,
    email: &str,
    permissions: u32,
) -> Result<User> {
    let row: UserRow = sqlx::query_as(&format!(
        "INSERT INTO users (oauth_subject, email, permissions) VALUES (?, ?, ?) RETURNING {}",
        USER_COLUMNS
    ))
    .bind(subject)
    .bind(email)
    .bind(i64::from(permissions))
    .fetch_one(exec)
    .await?;
    Ok(row.into())
}

pub async fn set_permissions<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: i64,
    permissions: Permissions,
) -> Result<bool> {
    let result = sqlx::query("UPDATE users SET permissions = ? WHERE user_id = ?")
        .bind(i64::from(permissions.bits()))
        .bind(user_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::TempDir;

    async fn db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("u.db").display());
        let db = Database::connect(&url, 2).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn upsert_keeps_id_and_permissions() {
        let (_dir, db) = db().await;
        let first = upsert_login(db.pool(), "sub-1", "old@example.com").await.unwrap();
        assert_eq!(first.permissions, Permissions::NONE);

        set_permissions(db.pool(), first.id, Permissions::CAN_ADD)
            .await
            .unwrap();
        let again = upsert_login(db.pool(), "sub-1", "new@example.com").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.email, "new@example.com");
        assert_eq!(again.permissions, Permissions::CAN_ADD);
    }

    #[tokio::test]
    async fn lookups() {
        let (_dir, db) = db().await;
        let created = create(db.pool(), "cn-worker", "w@example.com", 2).await.unwrap();
        assert_eq!(
            by_subject(db.pool(), "cn-worker").await.unwrap().unwrap().id,
            created.id
        );
        assert_eq!(
            by_id(db.pool(), created.id).await.unwrap().unwrap().permissions,
            Permissions::CAN_RENDER
        );
        assert!(by_subject(db.pool(), "missing").await.unwrap().is_none());
        assert!(create(db.pool(), "cn-worker", "dup", 0).await.is_err());
    }
}
