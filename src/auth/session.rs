use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::sync::RwLock;

use crate::clock::{to_chrono, Clock};
use crate::error::{Result, SchedulerError};
use crate::storage::sessions::{self, SessionRecord};
use crate::storage::Database;

/// Cookie length in random bytes.
const COOKIE_BYTES: usize = 16;

/// Browser sessions, persisted in the `sessions` table with a read-through
/// cache in front.
pub struct SessionStore {
    db: Database,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            db,
            clock,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Starts or refreshes a session for `user_id`. A `prior` cookie is
    /// extended when it is live and belongs to the same user; otherwise a
    /// fresh cookie is issued.
    pub async fn login(&self, user_id: i64, prior: Option<&str>) -> Result<SessionRecord> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(self.ttl);

        if let Some(cookie) = prior.filter(|c| !c.is_empty()) {
            if sessions::refresh(self.db.pool(), cookie, user_id, now, expires_at).await? {
                let record = SessionRecord {
                    cookie: cookie.to_string(),
                    user_id,
                    expires_at,
                };
                self.cache
                    .write()
                    .await
                    .insert(record.cookie.clone(), record.clone());
                tracing::debug!(user_id, "Session refreshed");
                return Ok(record);
            }
        }

        let record = SessionRecord {
            cookie: new_cookie(),
            user_id,
            expires_at,
        };
        sessions::insert(self.db.pool(), &record).await?;
        self.cache
            .write()
            .await
            .insert(record.cookie.clone(), record.clone());
        tracing::info!(user_id, "Session created");
        Ok(record)
    }

    /// Resolves a cookie to its live session.
    pub async fn check(&self, cookie: &str) -> Result<SessionRecord> {
        let now = self.clock.now();
        let cached = self.cache.read().await.get(cookie).cloned();
        let record = match cached {
            Some(record) => Some(record),
            None => {
                let stored = sessions::fetch(self.db.pool(), cookie).await?;
                if let Some(ref record) = stored {
                    if record.expires_at > now {
                        self.cache
                            .write()
                            .await
                            .insert(cookie.to_string(), record.clone());
                    }
                }
                stored
            }
        };

        match record {
            Some(record) if record.expires_at > now => Ok(record),
            Some(_) => {
                self.cache.write().await.remove(cookie);
                Err(SchedulerError::Unauthenticated("session expired".to_string()))
            }
            None => Err(SchedulerError::Unauthenticated("unknown session".to_string())),
        }
    }

    /// Ends a session. Unknown cookies are fine.
    pub async fn logout(&self, cookie: &str) -> Result<()> {
        self.cache.write().await.remove(cookie);
        if sessions::delete(self.db.pool(), cookie).await? {
            tracing::info!("Session ended");
        }
        Ok(())
    }

    /// Deletes expired sessions from the table and the cache.
    pub async fn reap(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = sessions::delete_expired(self.db.pool(), now).await?;
        let mut cache = self.cache.write().await;
        for cookie in &removed {
            cache.remove(cookie);
        }
        cache.retain(|_, record| record.expires_at > now);
        Ok(removed.len())
    }
}

/// 128 random bits, base64url without padding.
pub fn new_cookie() -> String {
    let mut bytes = [0u8; COOKIE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
