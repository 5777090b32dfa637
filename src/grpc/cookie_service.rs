use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::auth::{SessionStore, TokenVerifier};
use crate::config::Deadlines;
use crate::error::SchedulerError;
use crate::grpc::call::{Gate, RpcContext};
use crate::proto::cookie_monster_server::CookieMonster;
use crate::proto::{
    CheckCookieReply, CheckCookieRequest, LoginReply, LoginRequest, LogoutReply, LogoutRequest,
};
use crate::retry::{with_retry, DB_RETRIES};
use crate::storage::{users, Database};

/// The `CookieMonster` gRPC service. Only frontend peers may call it.
pub struct CookieService {
    ctx: RpcContext,
    deadlines: Deadlines,
    db: Database,
    verifier: Arc<TokenVerifier>,
    sessions: Arc<SessionStore>,
}

impl CookieService {
    pub fn new(
        ctx: RpcContext,
        deadlines: Deadlines,
        db: Database,
        verifier: Arc<TokenVerifier>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            ctx,
            deadlines,
            db,
            verifier,
            sessions,
        }
    }
}

#[tonic::async_trait]
impl CookieMonster for CookieService {
    async fn login(&self, request: Request<LoginRequest>) -> Result<Response<LoginReply>, Status> {
        let (db, verifier, sessions) = (&self.db, &self.verifier, &self.sessions);
        self.ctx
            .unary("Login", Gate::Frontend, self.deadlines.worker, request, |_, req| async move {
                let claims = verifier.verify(&req.jwt).await?;
                let (subject, email) = (claims.sub.as_str(), claims.email.as_str());
                let user = with_retry("login", DB_RETRIES, || {
                    users::upsert_login(db.pool(), subject, email)
                })
                .await?;
                let prior = Some(req.cookie.as_str()).filter(|c| !c.is_empty());
                let session = sessions.login(user.id, prior).await?;
                Ok(LoginReply {
                    cookie: session.cookie,
                    expires_ms: session.expires_at.timestamp_millis(),
                })
            })
            .await
    }

    async fn logout(
        &self,
        request: Request<LogoutRequest>,
    ) -> Result<Response<LogoutReply>, Status> {
        let sessions = &self.sessions;
        self.ctx
            .unary("Logout", Gate::Frontend, self.deadlines.worker, request, |_, req| async move {
                if !req.cookie.is_empty() {
                    sessions.logout(&req.cookie).await?;
                }
                Ok(LogoutReply {})
            })
            .await
    }

    async fn check_cookie(
        &self,
        request: Request<CheckCookieRequest>,
    ) -> Result<Response<CheckCookieReply>, Status> {
        let (db, sessions) = (&self.db, &self.sessions);
        self.ctx
            .unary("CheckCookie", Gate::Frontend, self.deadlines.ui, request, |_, req| async move {
                let session = sessions.check(&req.cookie).await?;
                let user = users::by_id(db.pool(), session.user_id)
                    .await?
                    .ok_or_else(|| {
                        SchedulerError::Unauthenticated("session user is gone".to_string())
                    })?;
                Ok(CheckCookieReply {
                    user_id: user.id,
                    email: user.email,
                })
            })
            .await
    }
}
