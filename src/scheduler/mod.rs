pub mod introspect;
pub mod lease;
pub mod manager;
pub mod order;
pub mod reaper;
pub mod results;
pub mod stats;

pub use introspect::Introspector;
pub use lease::{Lease, LeaseFilter, LeaseState};
pub use manager::{Handout, LeaseManager};
pub use order::{Order, OrderFilter};
pub use reaper::{ReapReport, Reaper};
pub use results::{Completion, ResultStore};
pub use stats::StatsCache;

use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Parses a required id supplied by a caller.
pub fn parse_id(field: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| SchedulerError::InvalidArgument(format!("malformed {}: {:?}", field, value)))
}

/// Like [`parse_id`], but an empty value means "absent".
pub fn parse_opt_id(field: &str, value: &str) -> Result<Option<Uuid>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_id(field, value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ids() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("lease_id", &id.to_string()).unwrap(), id);
        assert_eq!(parse_opt_id("batch_id", "").unwrap(), None);
        assert_eq!(parse_opt_id("batch_id", &id.to_string()).unwrap(), Some(id));
        assert!(matches!(
            parse_id("lease_id", "nope"),
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert!(parse_opt_id("batch_id", "nope").is_err());
    }
}
