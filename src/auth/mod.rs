//! Caller identity.
//!
//! Every RPC arrives over mutual TLS. The client certificate CN names a
//! user (by OIDC subject). A peer whose user has the `frontend` permission
//! may act on behalf of an end user by forwarding that user's session
//! cookie and address in request metadata.

pub mod caller;
pub mod issuer;
pub mod oidc;
pub mod session;
pub mod user;

use std::sync::Arc;

pub use caller::{capture_caller, CallerInfo};
pub use issuer::{CertIssuer, IssuedCert};
pub use oidc::{HttpKeySource, KeySource, StaticKeySource, TokenVerifier};
pub use session::SessionStore;
pub use user::{Permissions, User};

use crate::error::{Result, SchedulerError};
use crate::storage::{users, Database};

/// The resolved identity behind one call.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Identity the call acts as.
    pub user: User,
    /// Certificate holder. Differs from `user` when a frontend forwards a
    /// session cookie.
    pub peer: User,
    /// Forwarded cookie the identity was taken from.
    pub cookie: Option<String>,
    /// End-user address when forwarded, else the peer socket address.
    pub address: String,
    pub hostname: String,
    pub request_id: String,
}

impl Principal {
    pub fn via_cookie(&self) -> bool {
        self.cookie.is_some()
    }

    pub fn require(&self, permission: Permissions) -> Result<()> {
        self.user.require(permission)
    }
}

pub struct Authenticator {
    db: Database,
    sessions: Arc<SessionStore>,
}

impl Authenticator {
    pub fn new(db: Database, sessions: Arc<SessionStore>) -> Self {
        Self { db, sessions }
    }

    /// User named by the client certificate.
    pub async fn peer(&self, caller: &CallerInfo) -> Result<User> {
        let cn = caller
            .peer_cn
            .as_deref()
            .ok_or_else(|| SchedulerError::Unauthenticated("no client certificate".to_string()))?;
        users::by_subject(self.db.pool(), cn)
            .await?
            .ok_or_else(|| SchedulerError::Unauthenticated(format!("unknown client {:?}", cn)))
    }

    /// A frontend peer acting as itself. Other peers are refused.
    pub async fn frontend(&self, caller: &CallerInfo) -> Result<Principal> {
        let peer = self.peer(caller).await?;
        if !peer.is_frontend() {
            return Err(SchedulerError::PermissionDenied(format!(
                "user {} is not a frontend",
                peer.id
            )));
        }
        Ok(Principal {
            user: peer.clone(),
            peer,
            cookie: None,
            address: caller
                .forwarded_addr
                .clone()
                .unwrap_or_else(|| caller.peer_addr_string()),
            hostname: caller.hostname.clone().unwrap_or_default(),
            request_id: caller.request_id.clone(),
        })
    }

    /// Identity for a call. Forwarded cookies and addresses are honoured
    /// only from frontend peers.
    pub async fn principal(&self, caller: &CallerInfo) -> Result<Principal> {
        let peer = self.peer(caller).await?;
        let hostname = caller.hostname.clone().unwrap_or_default();

        if peer.is_frontend() {
            if let Some(cookie) = caller.forwarded_cookie.as_deref() {
                let session = self.sessions.check(cookie).await?;
                let user = users::by_id(self.db.pool(), session.user_id)
                    .await?
                    .ok_or_else(|| {
                        SchedulerError::Unauthenticated("session user is gone".to_string())
                    })?;
                let address = caller
                    .forwarded_addr
                    .clone()
                    .unwrap_or_else(|| caller.peer_addr_string());
                return Ok(Principal {
                    user,
                    peer,
                    cookie: Some(cookie.to_string()),
                    address,
                    hostname,
                    request_id: caller.request_id.clone(),
                });
            }
        } else if caller.forwarded_cookie.is_some() {
            tracing::debug!(
                peer = peer.id,
                "Ignoring forwarded cookie from non-frontend peer"
            );
        }

        Ok(Principal {
            user: peer.clone(),
            peer,
            cookie: None,
            address: caller.peer_addr_string(),
            hostname,
            request_id: caller.request_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Database,
        sessions: Arc<SessionStore>,
        auth: Authenticator,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("a.db").display());
        let db = Database::connect(&url, 2).await.unwrap();
        let sessions = Arc::new(SessionStore::new(
            db.clone(),
            Arc::new(ManualClock::default()),
            Duration::from_secs(600),
        ));
        let auth = Authenticator::new(db.clone(), sessions.clone());
        Fixture {
            _dir: dir,
            db,
            sessions,
            auth,
        }
    }

    #[tokio::test]
    async fn missing_or_unknown_cn_is_unauthenticated() {
        let f = setup().await;
        assert!(matches!(
            f.auth.principal(&CallerInfo::default()).await,
            Err(SchedulerError::Unauthenticated(_))
        ));
        assert!(matches!(
            f.auth.principal(&CallerInfo::with_cn("stranger")).await,
            Err(SchedulerError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn frontend_forwards_cookie_identity() {
        let f = setup().await;
        let ui = users::create(f.db.pool(), "ui", "", Permissions::FRONTEND.bits())
            .await
            .unwrap();
        let alice = users::create(f.db.pool(), "alice", "a@example.com", 0)
            .await
            .unwrap();
        let session = f.sessions.login(alice.id, None).await.unwrap();

        let mut caller = CallerInfo::with_cn("ui");
        caller.forwarded_cookie = Some(session.cookie.clone());
        caller.forwarded_addr = Some("198.51.100.7".to_string());

        let principal = f.auth.principal(&caller).await.unwrap();
        assert_eq!(principal.user.id, alice.id);
        assert_eq!(principal.peer.id, ui.id);
        assert!(principal.via_cookie());
        assert_eq!(principal.address, "198.51.100.7");

        caller.forwarded_cookie = Some("bogus".to_string());
        assert!(matches!(
            f.auth.principal(&caller).await,
            Err(SchedulerError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn non_frontend_cookie_is_ignored() {
        let f = setup().await;
        let worker = users::create(f.db.pool(), "worker", "", Permissions::CAN_RENDER.bits())
            .await
            .unwrap();
        let alice = users::create(f.db.pool(), "alice", "", Permissions::ADMIN.bits())
            .await
            .unwrap();
        let session = f.sessions.login(alice.id, None).await.unwrap();

        let mut caller = CallerInfo::with_cn("worker");
        caller.forwarded_cookie = Some(session.cookie);
        let principal = f.auth.principal(&caller).await.unwrap();
        assert_eq!(principal.user.id, worker.id);
        assert!(!principal.via_cookie());

        assert!(matches!(
            f.auth.frontend(&caller).await,
            Err(SchedulerError::PermissionDenied(_))
        ));
    }
}
