//! Domain types to wire messages.

use chrono::{DateTime, Utc};
use prost::Message;

use crate::clock::millis_to_datetime;
use crate::proto;
use crate::scheduler::{Lease, Order};
use crate::storage::stats::Counts;

pub fn lease_to_proto(lease: &Lease) -> proto::Lease {
    let metadata = lease.metadata.as_deref().and_then(|raw| {
        proto::RenderingMetadata::decode(raw)
            .map_err(|e| tracing::warn!(lease_id = %lease.id, error = %e, "Undecodable lease metadata"))
            .ok()
    });
    proto::Lease {
        lease_id: lease.id.to_string(),
        order_id: lease.order_id.to_string(),
        done: lease.done,
        failed: lease.failed,
        failed_reason: lease.failed_reason.clone().unwrap_or_default(),
        created_ms: lease.created_at.timestamp_millis(),
        updated_ms: lease.updated_at.timestamp_millis(),
        expires_ms: lease.expires_at.timestamp_millis(),
        user_id: lease.user_id,
        address: lease.address.clone(),
        hostname: lease.hostname.clone(),
        metadata,
        batch_id: lease.batch_id.map(|b| b.to_string()).unwrap_or_default(),
    }
}

pub fn order_to_proto(order: &Order) -> proto::Order {
    proto::Order {
        order_id: order.id.to_string(),
        batch_id: order.batch_id.map(|b| b.to_string()).unwrap_or_default(),
        owner_id: order.owner_id,
        definition: order.definition.clone(),
        created_ms: order.created_at.timestamp_millis(),
        poisoned: order.poisoned,
    }
}

pub fn counts_to_proto(counts: &Counts) -> proto::StatsReply {
    proto::StatsReply {
        orders: counts.orders,
        active_orders: counts.active_orders,
        done_orders: counts.done_orders,
        leases: counts.leases,
        active_leases: counts.active_leases,
        done_leases: counts.done_leases,
        failed_leases: counts.failed_leases,
        poisoned_orders: counts.poisoned_orders,
        sessions: counts.sessions,
    }
}

/// A zero or negative bound means "no bound".
pub fn since_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    (ms > 0).then(|| millis_to_datetime(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn lease_metadata_is_decoded() {
        let t = millis_to_datetime(5_000);
        let meta = proto::RenderingMetadata {
            hostname: "render-3".to_string(),
            ..Default::default()
        };
        let mut lease = Lease {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            batch_id: None,
            order_owner_id: 1,
            user_id: 2,
            address: "10.0.0.1:4000".to_string(),
            hostname: "render-3".to_string(),
            created_at: t,
            updated_at: t,
            expires_at: t,
            done: true,
            failed: false,
            failed_reason: None,
            metadata: Some(meta.encode_to_vec()),
        };
        let wire = lease_to_proto(&lease);
        assert_eq!(wire.metadata.unwrap().hostname, "render-3");
        assert_eq!(wire.created_ms, 5_000);
        assert_eq!(wire.batch_id, "");

        lease.metadata = Some(vec![0xff, 0xff, 0xff]);
        assert!(lease_to_proto(&lease).metadata.is_none());
    }

    #[test]
    fn since_zero_is_unbounded() {
        assert_eq!(since_from_ms(0), None);
        assert_eq!(since_from_ms(1_000), Some(millis_to_datetime(1_000)));
    }
}
