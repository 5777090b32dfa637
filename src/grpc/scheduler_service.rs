use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use tonic::{Request, Response, Status};

use crate::auth::CertIssuer;
use crate::clock::Clock;
use crate::config::Deadlines;
use crate::error::SchedulerError;
use crate::grpc::call::{Gate, ReplyStream, RpcContext};
use crate::grpc::convert::{counts_to_proto, lease_to_proto, order_to_proto, since_from_ms};
use crate::proto::scheduler_server::Scheduler;
use crate::proto::{
    AddReply, AddRequest, CertificateReply, CertificateRequest, DoneReply, DoneRequest,
    FailedReply, FailedRequest, GetReply, GetRequest, LeaseReply, LeaseRequest, LeasesReply,
    LeasesRequest, OrderReply, OrderRequest, OrdersReply, OrdersRequest, RenewReply,
    RenewRequest, ResultReply, ResultRequest, StatsReply, StatsRequest,
};
use crate::scheduler::{
    parse_id, parse_opt_id, Completion, Introspector, LeaseFilter, LeaseManager, OrderFilter,
    StatsCache,
};

/// The `Scheduler` gRPC service: worker, submission and introspection RPCs.
pub struct SchedulerService {
    ctx: RpcContext,
    deadlines: Deadlines,
    manager: Arc<LeaseManager>,
    introspector: Arc<Introspector>,
    stats: Arc<StatsCache>,
    issuer: Option<Arc<CertIssuer>>,
    clock: Arc<dyn Clock>,
}

impl SchedulerService {
    pub fn new(
        ctx: RpcContext,
        deadlines: Deadlines,
        manager: Arc<LeaseManager>,
        introspector: Arc<Introspector>,
        stats: Arc<StatsCache>,
        issuer: Option<Arc<CertIssuer>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ctx,
            deadlines,
            manager,
            introspector,
            stats,
            issuer,
            clock,
        }
    }
}

#[tonic::async_trait]
impl Scheduler for SchedulerService {
    type LeasesStream = ReplyStream<LeasesReply>;
    type OrdersStream = ReplyStream<OrdersReply>;
    type ResultStream = ReplyStream<ResultReply>;

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetReply>, Status> {
        let manager = &self.manager;
        self.ctx
            .unary("Get", Gate::Caller, self.deadlines.worker, request, |p, _| async move {
                let handout = manager.get(&p).await?;
                Ok(GetReply {
                    lease_id: handout.lease_id.to_string(),
                    order_definition: handout.definition,
                })
            })
            .await
    }

    async fn renew(&self, request: Request<RenewRequest>) -> Result<Response<RenewReply>, Status> {
        let manager = &self.manager;
        self.ctx
            .unary("Renew", Gate::Caller, self.deadlines.worker, request, |p, req| async move {
                let lease_id = parse_id("lease_id", &req.lease_id)?;
                let expires_at = manager.renew(&p, lease_id, req.extend_sec).await?;
                Ok(RenewReply {
                    new_timeout_ms: expires_at.timestamp_millis(),
                })
            })
            .await
    }

    async fn done(&self, request: Request<DoneRequest>) -> Result<Response<DoneReply>, Status> {
        let manager = &self.manager;
        self.ctx
            .unary("Done", Gate::Caller, self.deadlines.worker, request, |p, req| async move {
                let lease_id = parse_id("lease_id", &req.lease_id)?;
                let completion = Completion {
                    image: Bytes::from(req.image),
                    stdout: req.stdout,
                    stderr: req.stderr,
                    metadata: req.metadata,
                };
                manager.done(&p, lease_id, completion).await?;
                Ok(DoneReply {})
            })
            .await
    }

    async fn failed(
        &self,
        request: Request<FailedRequest>,
    ) -> Result<Response<FailedReply>, Status> {
        let manager = &self.manager;
        self.ctx
            .unary("Failed", Gate::Caller, self.deadlines.worker, request, |p, req| async move {
                let lease_id = parse_id("lease_id", &req.lease_id)?;
                manager.failed(&p, lease_id, &req.reason).await?;
                Ok(FailedReply {})
            })
            .await
    }

    async fn add(&self, request: Request<AddRequest>) -> Result<Response<AddReply>, Status> {
        let manager = &self.manager;
        self.ctx
            .unary("Add", Gate::Caller, self.deadlines.worker, request, |p, req| async move {
                let order_id = manager
                    .add(&p, req.order_definition, &req.batch_id)
                    .await?;
                Ok(AddReply {
                    order_id: order_id.to_string(),
                })
            })
            .await
    }

    async fn lease(&self, request: Request<LeaseRequest>) -> Result<Response<LeaseReply>, Status> {
        let introspector = &self.introspector;
        self.ctx
            .unary("Lease", Gate::Caller, self.deadlines.ui, request, |p, req| async move {
                let lease_id = parse_id("lease_id", &req.lease_id)?;
                let lease = introspector.lease(&p, lease_id).await?;
                Ok(LeaseReply {
                    lease: Some(lease_to_proto(&lease)),
                })
            })
            .await
    }

    async fn leases(
        &self,
        request: Request<LeasesRequest>,
    ) -> Result<Response<Self::LeasesStream>, Status> {
        let introspector = &self.introspector;
        self.ctx
            .server_stream("Leases", self.deadlines.stream, request, |p, req| async move {
                let filter = LeaseFilter {
                    done: req.done,
                    batch_id: parse_opt_id("batch_id", &req.batch_id)?,
                    since: since_from_ms(req.since_ms),
                    visible_to: None,
                };
                Ok(introspector
                    .lease_stream(&p, filter, req.order)
                    .map_ok(|(lease, order)| LeasesReply {
                        lease: Some(lease_to_proto(&lease)),
                        order: order.as_ref().map(order_to_proto),
                    })
                    .boxed())
            })
            .await
    }

    async fn order(&self, request: Request<OrderRequest>) -> Result<Response<OrderReply>, Status> {
        let introspector = &self.introspector;
        self.ctx
            .unary("Order", Gate::Caller, self.deadlines.ui, request, |p, req| async move {
                let ids = req
                    .order_id
                    .iter()
                    .map(|id| parse_id("order_id", id))
                    .collect::<crate::error::Result<Vec<_>>>()?;
                let orders = introspector.orders(&p, &ids).await?;
                Ok(OrderReply {
                    order: orders.iter().map(order_to_proto).collect(),
                })
            })
            .await
    }

    async fn orders(
        &self,
        request: Request<OrdersRequest>,
    ) -> Result<Response<Self::OrdersStream>, Status> {
        let introspector = &self.introspector;
        self.ctx
            .server_stream("Orders", self.deadlines.stream, request, |p, req| async move {
                let filter = OrderFilter {
                    batch_id: parse_opt_id("batch_id", &req.batch_id)?,
                    since: since_from_ms(req.since_ms),
                    owner_id: None,
                };
                Ok(introspector
                    .order_stream(&p, filter)
                    .map_ok(|order| OrdersReply {
                        order: Some(order_to_proto(&order)),
                    })
                    .boxed())
            })
            .await
    }

    async fn result(
        &self,
        request: Request<ResultRequest>,
    ) -> Result<Response<Self::ResultStream>, Status> {
        let introspector = &self.introspector;
        self.ctx
            .server_stream("Result", self.deadlines.stream, request, |p, req| async move {
                let lease_id = parse_id("lease_id", &req.lease_id)?;
                let body = introspector.result(&p, lease_id, req.data).await?;
                let Some(blob) = body.chunks else {
                    let header = ResultReply {
                        data: Vec::new(),
                        content_type: body.content_type,
                    };
                    return Ok(stream::once(future::ready(Ok(header))).boxed());
                };

                // Read the first chunk up front so a broken blob fails the
                // call before any data is sent.
                let mut chunks = blob.chunks;
                let first = chunks.try_next().await?.unwrap_or_default();
                let head = ResultReply {
                    data: first.to_vec(),
                    content_type: body.content_type,
                };
                let rest = chunks.map_ok(|chunk| ResultReply {
                    data: chunk.to_vec(),
                    content_type: String::new(),
                });
                Ok(stream::once(future::ready(Ok(head))).chain(rest).boxed())
            })
            .await
    }

    async fn stats(&self, request: Request<StatsRequest>) -> Result<Response<StatsReply>, Status> {
        let stats = &self.stats;
        self.ctx
            .unary("Stats", Gate::Caller, self.deadlines.ui, request, |_, _| async move {
                Ok(counts_to_proto(&stats.get().await?))
            })
            .await
    }

    async fn certificate(
        &self,
        request: Request<CertificateRequest>,
    ) -> Result<Response<CertificateReply>, Status> {
        let issuer = self.issuer.as_deref();
        let clock = &self.clock;
        self.ctx
            .unary("Certificate", Gate::Caller, self.deadlines.ui, request, |p, _| async move {
                if !p.via_cookie() {
                    return Err(SchedulerError::PermissionDenied(
                        "certificates are issued to signed-in users only".to_string(),
                    ));
                }
                let issuer = issuer.ok_or_else(|| {
                    SchedulerError::FailedPrecondition("no issuing CA configured".to_string())
                })?;
                let issued = issuer.issue(&p.user.subject, clock.now())?;
                tracing::info!(
                    user_id = p.user.id,
                    expires_at = %issued.expires_at,
                    "Issued worker certificate"
                );
                Ok(CertificateReply {
                    pem: issued.cert_pem,
                    private_key_pem: issued.key_pem,
                    expires_ms: issued.expires_at.timestamp_millis(),
                })
            })
            .await
    }
}
