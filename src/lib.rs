pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod node;
pub mod retry;
pub mod rpclog;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod tls;

// Generated protobuf types for the Scheduler and CookieMonster services,
// the rendering metadata and the audit log.
pub mod proto {
    tonic::include_proto!("qpov");
}
