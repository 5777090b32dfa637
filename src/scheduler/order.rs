use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An immutable unit of rendering work. The definition is opaque to the
/// scheduler; only workers interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub owner_id: i64,
    pub definition: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Advisory flag set after repeated failures; poisoned orders are not
    /// handed out.
    pub poisoned: bool,
}

impl Order {
    pub fn new(
        owner_id: i64,
        definition: Vec<u8>,
        batch_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            owner_id,
            definition,
            created_at,
            poisoned: false,
        }
    }
}

/// Filter for streaming orders.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub batch_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    /// Restrict to orders owned by this user. `None` for admins.
    pub owner_id: Option<i64>,
}
