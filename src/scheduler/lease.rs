use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Reason recorded by the reaper when it fails an overdue lease.
pub const EXPIRED_REASON: &str = "expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    /// Past `expires_at` but not yet reaped.
    Expired,
    Done,
    Failed,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Active => write!(f, "active"),
            LeaseState::Expired => write!(f, "expired"),
            LeaseState::Done => write!(f, "done"),
            LeaseState::Failed => write!(f, "failed"),
        }
    }
}

/// One attempt at executing an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Batch of the leased order, joined from `orders`.
    pub batch_id: Option<Uuid>,
    /// Owner of the leased order, joined from `orders`.
    pub order_owner_id: i64,
    /// Worker identity at handout.
    pub user_id: i64,
    pub address: String,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub done: bool,
    pub failed: bool,
    pub failed_reason: Option<String>,
    /// Encoded `RenderingMetadata`, stored verbatim.
    pub metadata: Option<Vec<u8>>,
}

impl Lease {
    /// A lease expiring exactly now is already expired.
    pub fn state(&self, now: DateTime<Utc>) -> LeaseState {
        if self.done {
            LeaseState::Done
        } else if self.failed {
            LeaseState::Failed
        } else if self.expires_at <= now {
            LeaseState::Expired
        } else {
            LeaseState::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == LeaseState::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.failed
    }
}

/// Filter for streaming leases.
#[derive(Debug, Clone, Default)]
pub struct LeaseFilter {
    pub done: Option<bool>,
    pub batch_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    /// Restrict to leases the user holds or whose order they own.
    /// `None` for admins.
    pub visible_to: Option<i64>,
}
