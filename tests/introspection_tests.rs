//! Read-side RPCs: Lease, Leases, Order, Orders, Result and Stats.


use std::time::Duration;

use tonic::Code;
use uuid::Uuid;

use qpov_scheduler::auth::Permissions;
use qpov_scheduler::proto::scheduler_server::Scheduler;
use qpov_scheduler::proto::{
    AddRequest, DoneRequest, GetRequest, LeaseRequest, LeasesRequest, OrderRequest, OrdersRequest,
    ResultRequest, StatsRequest,
};
use test_harness::{as_peer, collect, Harness};

/// Adds an order as `owner` and has `worker` lease it. Returns
/// `(order_id, lease_id)`.
async fn leased(h: &Harness, owner: &str, worker: &str, batch_id: &str) -> (String, String) {
    let order_id = h
        .scheduler
        .add(as_peer(
            owner,
            AddRequest {
                order_definition: format!("scene for {}", worker).into_bytes(),
                batch_id: batch_id.to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .order_id;
    h.advance(Duration::from_millis(1));
    let lease_id = h
        .scheduler
        .get(as_peer(worker, GetRequest {}))
        .await
        .unwrap()
        .into_inner()
        .lease_id;
    h.advance(Duration::from_millis(1));
    (order_id, lease_id)
}

async fn finish(h: &Harness, worker: &str, lease_id: &str) {
    h.scheduler
        .done(as_peer(
            worker,
            DoneRequest {
                lease_id: lease_id.to_string(),
                image: vec![7u8; 40 * 1024],
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    h.advance(Duration::from_millis(1));
}

#[tokio::test]
async fn lease_visibility() {
    let h = Harness::new().await;
    h.submitter("owner").await;
    h.worker("w").await;
    h.worker("other").await;
    h.user("root", Permissions::ADMIN).await;
    let (_, lease_id) = leased(&h, "owner", "w", "").await;

    for cn in ["owner", "w", "root"] {
        h.scheduler
            .lease(as_peer(
                cn,
                LeaseRequest {
                    lease_id: lease_id.clone(),
                },
            ))
            .await
            .unwrap();
    }

    let hidden = h
        .scheduler
        .lease(as_peer(
            "other",
            LeaseRequest {
                lease_id: lease_id.clone(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(hidden.code(), Code::PermissionDenied);

    let missing = h
        .scheduler
        .lease(as_peer(
            "root",
            LeaseRequest {
                lease_id: Uuid::new_v4().to_string(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(missing.code(), Code::NotFound);
}

#[tokio::test]
async fn order_lookup_skips_invisible_orders() {
    let h = Harness::new().await;
    h.submitter("a").await;
    h.submitter("b").await;
    h.worker("w").await;
    let (mine, _) = leased(&h, "a", "w", "").await;
    let (theirs, _) = leased(&h, "b", "w", "").await;

    let orders = h
        .scheduler
        .order(as_peer(
            "a",
            OrderRequest {
                order_id: vec![mine.clone(), theirs, Uuid::new_v4().to_string()],
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .order;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].order_id, mine);
    assert!(!orders[0].definition.is_empty());
}

#[tokio::test]
async fn leases_stream_filters_and_joins_orders() {
    let h = Harness::new().await;
    h.submitter("owner").await;
    h.worker("w").await;
    let batch = Uuid::new_v4().to_string();
    let (o1, l1) = leased(&h, "owner", "w", &batch).await;
    let (_, l2) = leased(&h, "owner", "w", "").await;
    finish(&h, "w", &l1).await;

    let all = collect(
        h.scheduler
            .leases(as_peer("owner", LeasesRequest::default()))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    // Most recently updated first.
    let ids: Vec<_> = all
        .iter()
        .map(|r| r.lease.as_ref().unwrap().lease_id.clone())
        .collect();
    assert_eq!(ids, vec![l1.clone(), l2.clone()]);
    assert!(all.iter().all(|r| r.order.is_none()));

    let done = collect(
        h.scheduler
            .leases(as_peer(
                "owner",
                LeasesRequest {
                    done: Some(true),
                    batch_id: batch.clone(),
                    order: true,
                    since_ms: 0,
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(done.len(), 1);
    let lease = done[0].lease.as_ref().unwrap();
    assert_eq!(lease.lease_id, l1);
    assert_eq!(lease.batch_id, batch);
    assert_eq!(done[0].order.as_ref().unwrap().order_id, o1);

    let pending = collect(
        h.scheduler
            .leases(as_peer(
                "w",
                LeasesRequest {
                    done: Some(false),
                    ..Default::default()
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].lease.as_ref().unwrap().lease_id, l2);
}

#[tokio::test]
async fn leases_stream_hides_other_users_work() {
    let h = Harness::new().await;
    h.submitter("owner").await;
    h.worker("w").await;
    h.worker("bystander").await;
    leased(&h, "owner", "w", "").await;

    let seen = collect(
        h.scheduler
            .leases(as_peer("bystander", LeasesRequest::default()))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert!(seen.is_empty());
}

#[tokio::test]
async fn orders_stream_by_batch_and_since() {
    let h = Harness::new().await;
    h.submitter("owner").await;
    h.worker("w").await;
    let batch = Uuid::new_v4().to_string();
    leased(&h, "owner", "w", &batch).await;
    let cutoff = h.clock_ms();
    let (late, _) = leased(&h, "owner", "w", &batch).await;
    leased(&h, "owner", "w", "").await;

    let in_batch = collect(
        h.scheduler
            .orders(as_peer(
                "owner",
                OrdersRequest {
                    batch_id: batch.clone(),
                    since_ms: 0,
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(in_batch.len(), 2);

    let recent = collect(
        h.scheduler
            .orders(as_peer(
                "owner",
                OrdersRequest {
                    batch_id: batch,
                    since_ms: cutoff,
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].order.as_ref().unwrap().order_id, late);
}

#[tokio::test]
async fn result_streams_in_chunks() {
    let h = Harness::new().await;
    h.submitter("owner").await;
    h.worker("w").await;
    let (_, lease_id) = leased(&h, "owner", "w", "").await;

    let not_done = h
        .scheduler
        .result(as_peer(
            "owner",
            ResultRequest {
                lease_id: lease_id.clone(),
                data: true,
            },
        ))
        .await
        .err().unwrap();
    assert_eq!(not_done.code(), Code::NotFound);

    finish(&h, "w", &lease_id).await;

    let header = collect(
        h.scheduler
            .result(as_peer(
                "owner",
                ResultRequest {
                    lease_id: lease_id.clone(),
                    data: false,
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(header.len(), 1);
    assert_eq!(header[0].content_type, "image/png");
    assert!(header[0].data.is_empty());

    let chunks = collect(
        h.scheduler
            .result(as_peer(
                "owner",
                ResultRequest {
                    lease_id,
                    data: true,
                },
            ))
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert!(chunks.len() >= 3);
    assert!(chunks.iter().all(|c| c.data.len() <= 16 * 1024));
    assert_eq!(chunks.iter().map(|c| c.data.len()).sum::<usize>(), 40 * 1024);
    assert_eq!(chunks[0].content_type, "image/png");
    assert!(chunks[1..].iter().all(|c| c.content_type.is_empty()));
}

#[tokio::test]
async fn stats_needs_an_identity_only() {
    let h = Harness::new().await;
    h.user("nobody", Permissions::NONE).await;
    let stats = h
        .scheduler
        .stats(as_peer("nobody", StatsRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stats.orders, 0);

    let anonymous = h
        .scheduler
        .stats(test_harness::anonymous(StatsRequest {}))
        .await
        .unwrap_err();
    assert_eq!(anonymous.code(), Code::Unauthenticated);
}
