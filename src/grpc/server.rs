use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::auth::capture_caller;
use crate::grpc::cookie_service::CookieService;
use crate::grpc::scheduler_service::SchedulerService;
use crate::proto::cookie_monster_server::CookieMonsterServer;
use crate::proto::scheduler_server::SchedulerServer;
use crate::tls::TlsIdentity;

/// Largest request or reply accepted. Done carries a whole rendered frame.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

pub struct GrpcServer {
    tls: Option<TlsIdentity>,
    scheduler: SchedulerService,
    cookies: CookieService,
}

impl GrpcServer {
    pub fn new(
        tls: Option<TlsIdentity>,
        scheduler: SchedulerService,
        cookies: CookieService,
    ) -> Self {
        Self {
            tls,
            scheduler,
            cookies,
        }
    }

    /// Serves on `listener` until `shutdown` fires, then stops accepting
    /// calls and waits for in-flight ones.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let tls = self.tls.is_some();
        let router = self.router()?;
        tracing::info!(addr = ?listener.local_addr().ok(), tls, "Serving gRPC");
        router
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    }

    fn router(self) -> Result<Router, tonic::transport::Error> {
        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_tls_config())?;
        }

        let scheduler = SchedulerServer::new(self.scheduler)
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);
        let cookies = CookieMonsterServer::new(self.cookies)
            .accept_compressed(CompressionEncoding::Gzip);

        Ok(builder
            .add_service(InterceptedService::new(scheduler, capture_caller))
            .add_service(InterceptedService::new(cookies, capture_caller)))
    }
}
