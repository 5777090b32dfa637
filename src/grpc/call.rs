//! Per-RPC plumbing shared by every handler: identity, deadline, one log
//! line and one audit record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::BoxStream;
use futures::StreamExt;
use prost::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status};

use crate::auth::{Authenticator, CallerInfo, Principal};
use crate::error::{Result, SchedulerError};
use crate::proto::RpcLogEntry;
use crate::rpclog::RpcLog;

/// Buffered replies between a stream's producer task and the client.
const STREAM_BUFFER: usize = 32;

/// How long a failed stream waits for the client to make room for the
/// final status once the call deadline has passed.
const TERMINAL_STATUS_GRACE: Duration = Duration::from_secs(10);

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

pub type ReplyStream<T> = Pin<Box<dyn futures::Stream<Item = std::result::Result<T, Status>> + Send>>;

/// Who may call a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Any known peer, or the end user a frontend forwards.
    Caller,
    /// Frontend peers only, acting as themselves.
    Frontend,
}

struct CallRecord {
    method: &'static str,
    caller: CallerInfo,
    started: Instant,
    start_ns: i64,
    request: Vec<u8>,
}

#[derive(Clone)]
pub struct RpcContext {
    auth: Arc<Authenticator>,
    rpclog: Option<Arc<RpcLog>>,
}

impl RpcContext {
    pub fn new(auth: Arc<Authenticator>, rpclog: Option<Arc<RpcLog>>) -> Self {
        Self { auth, rpclog }
    }

    /// Runs a unary handler under `deadline` (or the client's tighter one).
    pub async fn unary<Req, Rep, F, Fut>(
        &self,
        method: &'static str,
        gate: Gate,
        deadline: Duration,
        request: Request<Req>,
        handler: F,
    ) -> std::result::Result<Response<Rep>, Status>
    where
        Req: Message,
        Rep: Message,
        F: FnOnce(Principal, Req) -> Fut,
        Fut: Future<Output = Result<Rep>>,
    {
        let (record, deadline, req) = open(method, request, deadline);
        let mut user_id = 0;
        let outcome = tokio::time::timeout(deadline, async {
            let principal = self.authorize(gate, &record.caller).await?;
            user_id = principal.user.id;
            handler(principal, req).await
        })
        .await
        .unwrap_or_else(|_| Err(deadline_exceeded(method, deadline)));

        let reply = outcome
            .as_ref()
            .map(|rep| rep.encode_to_vec())
            .unwrap_or_default();
        self.close(&record, user_id, reply, outcome.as_ref().err())
            .await;
        outcome.map(Response::new).map_err(Status::from)
    }

    /// Runs a server-streaming handler.
    ///
    /// The handler authorizes and prepares the stream; errors there are
    /// returned as the call status. Items are then forwarded through a
    /// bounded channel by a separate task until the stream ends, fails, the
    /// client goes away, or the deadline passes.
    pub async fn server_stream<Req, Item, F, Fut>(
        &self,
        method: &'static str,
        deadline: Duration,
        request: Request<Req>,
        handler: F,
    ) -> std::result::Result<Response<ReplyStream<Item>>, Status>
    where
        Req: Message,
        Item: Message + Send + 'static,
        F: FnOnce(Principal, Req) -> Fut,
        Fut: Future<Output = Result<BoxStream<'static, Result<Item>>>>,
    {
        let (record, deadline, req) = open(method, request, deadline);
        let expires = Instant::now() + deadline;
        let mut user_id = 0;
        let prepared = tokio::time::timeout_at(expires, async {
            let principal = self.authorize(Gate::Caller, &record.caller).await?;
            user_id = principal.user.id;
            handler(principal, req).await
        })
        .await
        .unwrap_or_else(|_| Err(deadline_exceeded(method, deadline)));

        let mut items = match prepared {
            Ok(items) => items,
            Err(e) => {
                self.close(&record, user_id, Vec::new(), Some(&e)).await;
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut sent: u64 = 0;
            let failure = loop {
                let next = match tokio::time::timeout_at(expires, items.next()).await {
                    Ok(next) => next,
                    Err(_) => break Some(deadline_exceeded(method, deadline)),
                };
                let item = match next {
                    None => break None,
                    Some(Ok(item)) => item,
                    Some(Err(e)) => break Some(e),
                };
                match tokio::time::timeout_at(expires, tx.send(Ok(item))).await {
                    Ok(Ok(())) => sent += 1,
                    Ok(Err(_)) => {
                        break Some(SchedulerError::Canceled("client went away".to_string()))
                    }
                    Err(_) => break Some(deadline_exceeded(method, deadline)),
                }
            };

            if let Some(ref e) = failure {
                // Wait for room behind buffered items so the status is not
                // lost. A closed receiver needs nothing more.
                let until = expires.max(Instant::now() + TERMINAL_STATUS_GRACE);
                let status = Status::from(e.clone());
                if tokio::time::timeout_at(until, tx.send(Err(status)))
                    .await
                    .is_err()
                {
                    tracing::warn!(method, "Client did not drain stream, final status dropped");
                }
            }
            tracing::debug!(method, items = sent, "Stream finished");
            ctx.close(&record, user_id, Vec::new(), failure.as_ref())
                .await;
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as ReplyStream<Item>
        ))
    }

    async fn authorize(&self, gate: Gate, caller: &CallerInfo) -> Result<Principal> {
        match gate {
            Gate::Caller => self.auth.principal(caller).await,
            Gate::Frontend => self.auth.frontend(caller).await,
        }
    }

    async fn close(
        &self,
        record: &CallRecord,
        user_id: i64,
        reply: Vec<u8>,
        error: Option<&SchedulerError>,
    ) {
        let elapsed_ms = record.started.elapsed().as_millis() as u64;
        let code = error.map(SchedulerError::code).unwrap_or(Code::Ok);
        let peer = record.caller.peer_addr_string();
        match error {
            None => tracing::info!(
                method = record.method,
                request_id = %record.caller.request_id,
                user_id,
                peer = %peer,
                code = ?code,
                elapsed_ms,
                "RPC"
            ),
            Some(e)
                if matches!(
                    e,
                    SchedulerError::Unavailable(_) | SchedulerError::Internal(_)
                ) =>
            {
                tracing::warn!(
                    method = record.method,
                    request_id = %record.caller.request_id,
                    user_id,
                    peer = %peer,
                    code = ?code,
                    elapsed_ms,
                    error = %e,
                    "RPC"
                )
            }
            Some(e) => tracing::info!(
                method = record.method,
                request_id = %record.caller.request_id,
                user_id,
                peer = %peer,
                code = ?code,
                elapsed_ms,
                error = %e,
                "RPC"
            ),
        }

        if let Some(log) = &self.rpclog {
            let entry = RpcLogEntry {
                start_ns: record.start_ns,
                end_ns: unix_nanos(),
                method: record.method.to_string(),
                peer_address: peer,
                peer_cn: record.caller.peer_cn.clone().unwrap_or_default(),
                request: record.request.clone(),
                reply,
                error: error.map(|e| e.to_string()).unwrap_or_default(),
                request_id: record.caller.request_id.clone(),
                user_id,
            };
            log.record(&entry).await;
        }
    }
}

fn open<Req: Message>(
    method: &'static str,
    request: Request<Req>,
    default_deadline: Duration,
) -> (CallRecord, Duration, Req) {
    let caller = request
        .extensions()
        .get::<CallerInfo>()
        .cloned()
        .unwrap_or_else(|| CallerInfo::from_request(&request));
    let deadline = client_deadline(request.metadata())
        .map_or(default_deadline, |d| d.min(default_deadline));
    let req = request.into_inner();
    let record = CallRecord {
        method,
        caller,
        started: Instant::now(),
        start_ns: unix_nanos(),
        request: req.encode_to_vec(),
    };
    (record, deadline, req)
}

fn deadline_exceeded(method: &str, deadline: Duration) -> SchedulerError {
    SchedulerError::Canceled(format!(
        "{} exceeded its {}ms deadline",
        method,
        deadline.as_millis()
    ))
}

fn client_deadline(metadata: &MetadataMap) -> Option<Duration> {
    metadata
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
}

/// Parses a `grpc-timeout` header value: up to eight digits and a unit.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(n * 3600),
        "M" => Duration::from_secs(n * 60),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(timeout)
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
