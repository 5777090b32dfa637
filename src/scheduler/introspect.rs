//! Read-only views for the status UI.
//!
//! Admins see everything. Other users see leases they hold, leases on orders
//! they own, and orders they own.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Result, SchedulerError};
use crate::scheduler::lease::{Lease, LeaseFilter};
use crate::scheduler::order::{Order, OrderFilter};
use crate::scheduler::results::ResultStore;
use crate::storage::leases::{self, LeaseCursor};
use crate::storage::orders::{self, OrderCursor};
use crate::storage::{BlobStream, Database};

/// Rows fetched per query while streaming.
pub const PAGE_SIZE: i64 = 500;

/// Image of a done lease. `chunks` is absent when only the header was asked
/// for.
pub struct ResultBody {
    pub content_type: String,
    pub chunks: Option<BlobStream>,
}

pub struct Introspector {
    db: Database,
    results: ResultStore,
}

impl Introspector {
    pub fn new(db: Database, results: ResultStore) -> Self {
        Self { db, results }
    }

    pub async fn lease(&self, principal: &Principal, lease_id: Uuid) -> Result<Lease> {
        let lease = leases::fetch(self.db.pool(), lease_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("lease {}", lease_id)))?;
        if !principal.user.can_see(lease.user_id, lease.order_owner_id) {
            return Err(SchedulerError::PermissionDenied(format!(
                "lease {} is not visible to user {}",
                lease_id, principal.user.id
            )));
        }
        Ok(lease)
    }

    /// Looks up several orders at once. Unknown and invisible ids are
    /// skipped.
    pub async fn orders(&self, principal: &Principal, ids: &[Uuid]) -> Result<Vec<Order>> {
        let user = &principal.user;
        let found = orders::fetch_many(self.db.pool(), ids).await?;
        Ok(found
            .into_iter()
            .filter(|o| user.is_admin() || o.owner_id == user.id)
            .collect())
    }

    /// Streams matching leases, most recently updated first, each optionally
    /// joined with its order.
    pub fn lease_stream(
        &self,
        principal: &Principal,
        mut filter: LeaseFilter,
        with_order: bool,
    ) -> BoxStream<'static, Result<(Lease, Option<Order>)>> {
        filter.visible_to = (!principal.user.is_admin()).then_some(principal.user.id);
        let db = self.db.clone();

        stream::try_unfold(Position::Start, move |position| {
            next_lease_page(db.clone(), filter.clone(), with_order, position)
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Streams matching orders, newest first.
    pub fn order_stream(
        &self,
        principal: &Principal,
        mut filter: OrderFilter,
    ) -> BoxStream<'static, Result<Order>> {
        filter.owner_id = (!principal.user.is_admin()).then_some(principal.user.id);
        let db = self.db.clone();

        stream::try_unfold(Position::Start, move |position| {
            next_order_page(db.clone(), filter.clone(), position)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Opens the result image of a done lease.
    pub async fn result(
        &self,
        principal: &Principal,
        lease_id: Uuid,
        with_data: bool,
    ) -> Result<ResultBody> {
        let lease = self.lease(principal, lease_id).await?;
        if !lease.done {
            return Err(SchedulerError::NotFound(format!(
                "lease {} has no result",
                lease_id
            )));
        }
        let blob = self.results.open_image(&lease).await?;
        Ok(ResultBody {
            content_type: blob.content_type.clone(),
            chunks: with_data.then_some(blob),
        })
    }
}

/// Where a paged stream resumes.
enum Position<C> {
    Start,
    After(C),
    End,
}

impl<C> Position<C> {
    fn resume(self) -> Option<Option<C>> {
        match self {
            Position::Start => Some(None),
            Position::After(cursor) => Some(Some(cursor)),
            Position::End => None,
        }
    }

    /// A short page is the last one.
    fn after<T>(page: &[T], cursor: impl Fn(&T) -> C) -> Self {
        match page.last() {
            Some(last) if page.len() as i64 >= PAGE_SIZE => Position::After(cursor(last)),
            _ => Position::End,
        }
    }
}

type LeaseRows = Vec<(Lease, Option<Order>)>;

async fn next_lease_page(
    db: Database,
    filter: LeaseFilter,
    with_order: bool,
    position: Position<LeaseCursor>,
) -> Result<Option<(LeaseRows, Position<LeaseCursor>)>> {
    let Some(after) = position.resume() else {
        return Ok(None);
    };
    let page = leases::page(db.pool(), &filter, after, PAGE_SIZE).await?;
    if page.is_empty() {
        return Ok(None);
    }
    let next = Position::after(&page, |l| LeaseCursor::from(l));
    let rows = if with_order {
        join_orders(&db, page).await?
    } else {
        page.into_iter().map(|l| (l, None)).collect()
    };
    Ok(Some((rows, next)))
}

async fn next_order_page(
    db: Database,
    filter: OrderFilter,
    position: Position<OrderCursor>,
) -> Result<Option<(Vec<Order>, Position<OrderCursor>)>> {
    let Some(after) = position.resume() else {
        return Ok(None);
    };
    let page = orders::page(db.pool(), &filter, after, PAGE_SIZE).await?;
    if page.is_empty() {
        return Ok(None);
    }
    let next = Position::after(&page, |o| OrderCursor::from(o));
    Ok(Some((page, next)))
}

async fn join_orders(db: &Database, page: Vec<Lease>) -> Result<LeaseRows> {
    let mut ids: Vec<Uuid> = page.iter().map(|l| l.order_id).collect();
    ids.sort();
    ids.dedup();
    let found = orders::fetch_many(db.pool(), &ids).await?;
    Ok(page
        .into_iter()
        .map(|lease| {
            let order = found.iter().find(|o| o.id == lease.order_id).cloned();
            (lease, order)
        })
        .collect())
}
