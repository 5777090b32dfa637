//! Mutual TLS end to end: the client certificate CN is the caller identity.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::Code;

use qpov_scheduler::auth::{CertIssuer, Permissions, StaticKeySource};
use qpov_scheduler::clock::SystemClock;
use qpov_scheduler::config::{ServerConfig, TlsConfig};
use qpov_scheduler::node::{Dependencies, Node};
use qpov_scheduler::proto::scheduler_client::SchedulerClient;
use qpov_scheduler::proto::{GetRequest, StatsRequest};
use qpov_scheduler::storage::{users, Database, ObjectBlobStore};
use qpov_scheduler::tls::TlsIdentity;

struct Pki {
    ca_pem: String,
    ca_key_pem: String,
    server_pem: String,
    server_key_pem: String,
}

fn pki() -> Pki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca.distinguished_name
        .push(DnType::CommonName, "qpov test ca");
    ca.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_cert = ca.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server
        .distinguished_name
        .push(DnType::CommonName, "scheduler");
    server.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = server.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        ca_key_pem: ca_key.serialize_pem(),
        server_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
    }
}

struct Running {
    _dir: TempDir,
    port: u16,
    issuer: Arc<CertIssuer>,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), qpov_scheduler::node::NodeError>>,
}

async fn start(pki: &Pki) -> Running {
    let dir = TempDir::new().unwrap();
    let db_url = format!("sqlite://{}", dir.path().join("tls.db").display());
    let db = Database::connect(&db_url, 4).await.unwrap();
    users::create(db.pool(), "worker-1", "w1@example.com", Permissions::CAN_RENDER.bits())
        .await
        .unwrap();

    let issuer = Arc::new(CertIssuer::from_pem(&pki.ca_pem, &pki.ca_key_pem, 1).unwrap());
    let deps = Dependencies {
        db,
        blobs: Arc::new(ObjectBlobStore::in_memory()),
        clock: Arc::new(SystemClock),
        keys: Arc::new(StaticKeySource::new(test_harness::key_set())),
        issuer: Some(issuer.clone()),
        rpclog: None,
        tls: Some(TlsIdentity::from_pem(
            &pki.ca_pem,
            &pki.server_pem,
            &pki.server_key_pem,
        )),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig::new(listener.local_addr().unwrap(), db_url);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Node::new(config, deps).run_with_listener(listener, shutdown.clone()));

    Running {
        _dir: dir,
        port,
        issuer,
        shutdown,
        handle,
    }
}

async fn client(port: u16, tls: ClientTlsConfig) -> Result<SchedulerClient<Channel>, tonic::transport::Error> {
    let channel = Channel::from_shared(format!("https://localhost:{}", port))
        .unwrap()
        .tls_config(tls)?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await?;
    Ok(SchedulerClient::new(channel))
}

fn identity_for(pki: &Pki, issuer: &CertIssuer, subject: &str) -> ClientTlsConfig {
    let issued = issuer.issue(subject, Utc::now()).unwrap();
    TlsIdentity::from_pem(&pki.ca_pem, &issued.cert_pem, &issued.key_pem)
        .client_tls_config("localhost")
}

#[tokio::test]
async fn certificate_cn_identifies_the_caller() {
    let pki = pki();
    let running = start(&pki).await;

    let mut worker = client(
        running.port,
        identity_for(&pki, &running.issuer, "worker-1"),
    )
    .await
    .unwrap();
    // Known and allowed to render; there is just nothing to hand out.
    let status = worker.get(GetRequest {}).await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(
        worker
            .stats(StatsRequest {})
            .await
            .unwrap()
            .into_inner()
            .orders,
        0
    );

    let mut stranger = client(
        running.port,
        identity_for(&pki, &running.issuer, "nobody-we-know"),
    )
    .await
    .unwrap();
    let status = stranger.get(GetRequest {}).await.unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    running.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), running.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn client_without_certificate_is_refused() {
    let pki = pki();
    let running = start(&pki).await;

    let anonymous = ClientTlsConfig::new()
        .domain_name("localhost")
        .ca_certificate(tonic::transport::Certificate::from_pem(&pki.ca_pem));
    let outcome = match client(running.port, anonymous).await {
        Ok(mut c) => c.get(GetRequest {}).await.map(|_| ()).map_err(|s| s.code()),
        Err(_) => Err(Code::Unavailable),
    };
    assert!(outcome.is_err());

    running.shutdown.cancel();
}

#[tokio::test]
async fn identity_loads_from_files() {
    let pki = pki();
    let dir = TempDir::new().unwrap();
    let path = |name: &str| dir.path().join(name);
    std::fs::write(path("ca.pem"), &pki.ca_pem).unwrap();
    std::fs::write(path("server.pem"), &pki.server_pem).unwrap();
    std::fs::write(path("server.key"), &pki.server_key_pem).unwrap();

    let config = TlsConfig {
        ca_cert_path: Some(path("ca.pem")),
        cert_path: Some(path("server.pem")),
        key_path: Some(path("server.key")),
    };
    assert!(TlsIdentity::load(&config).await.unwrap().is_some());
}
