use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::Result;
use crate::storage::stats::{self, Counts};
use crate::storage::Database;

/// Aggregate counters, recomputed at most once per TTL.
pub struct StatsCache {
    db: Database,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Counts)>>,
}

impl StatsCache {
    pub fn new(db: Database, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            db,
            clock,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<Counts> {
        if let Some((at, counts)) = *self.cached.read().await {
            if at.elapsed() < self.ttl {
                return Ok(counts);
            }
        }

        let counts = stats::count(self.db.pool(), self.clock.now()).await?;
        *self.cached.write().await = Some((Instant::now(), counts));
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::order::Order;
    use crate::storage::{orders, users};
    use tempfile::TempDir;

    async fn setup(ttl: Duration) -> (TempDir, Database, StatsCache, i64) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("s.db").display());
        let db = Database::connect(&url, 2).await.unwrap();
        let owner = users::create(db.pool(), "owner", "", 1).await.unwrap();
        let cache = StatsCache::new(db.clone(), Arc::new(ManualClock::default()), ttl);
        (dir, db, cache, owner.id)
    }

    #[tokio::test]
    async fn serves_cached_counts_within_ttl() {
        let (_dir, db, cache, owner) = setup(Duration::from_secs(3600)).await;
        assert_eq!(cache.get().await.unwrap().orders, 0);

        let order = Order::new(owner, b"o".to_vec(), None, chrono::Utc::now());
        orders::insert(db.pool(), &order).await.unwrap();
        assert_eq!(cache.get().await.unwrap().orders, 0);
    }

    #[tokio::test]
    async fn recomputes_after_ttl() {
        let (_dir, db, cache, owner) = setup(Duration::ZERO).await;
        assert_eq!(cache.get().await.unwrap().orders, 0);

        let order = Order::new(owner, b"o".to_vec(), None, chrono::Utc::now());
        orders::insert(db.pool(), &order).await.unwrap();
        assert_eq!(cache.get().await.unwrap().orders, 1);
    }
}
