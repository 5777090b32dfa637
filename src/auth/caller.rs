use std::net::SocketAddr;

use tonic::{Request, Status};
use uuid::Uuid;

/// Metadata key carrying the end-user session cookie, set by the frontend.
pub const COOKIE_HEADER: &str = "http.cookie";
/// Metadata key carrying the end-user address, set by the frontend.
pub const REMOTE_ADDR_HEADER: &str = "http.remote_addr";
pub const REQUEST_ID_HEADER: &str = "request-id";
pub const HOSTNAME_HEADER: &str = "hostname";

/// Transport-level facts about the caller of one RPC.
///
/// Captured by [`capture_caller`] before the handler runs. Nothing here is
/// trusted yet; [`super::Authenticator`] decides what to believe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    /// Common name of the verified client certificate.
    pub peer_cn: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub forwarded_cookie: Option<String>,
    pub forwarded_addr: Option<String>,
    pub request_id: String,
    /// Worker hostname.
    pub hostname: Option<String>,
}

impl CallerInfo {
    pub fn from_request<T>(request: &Request<T>) -> Self {
        let header = |key: &str| {
            request
                .metadata()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let peer_cn = request
            .peer_certs()
            .and_then(|certs| certs.first().and_then(|c| common_name(c.as_ref())));

        Self {
            peer_cn,
            peer_addr: request.remote_addr(),
            forwarded_cookie: header(COOKIE_HEADER),
            forwarded_addr: header(REMOTE_ADDR_HEADER),
            request_id: header(REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string()),
            hostname: header(HOSTNAME_HEADER),
        }
    }

    /// Caller with a fixed certificate CN, for in-process use.
    pub fn with_cn(cn: impl Into<String>) -> Self {
        Self {
            peer_cn: Some(cn.into()),
            request_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn peer_addr_string(&self) -> String {
        self.peer_addr.map(|a| a.to_string()).unwrap_or_default()
    }
}

/// Interceptor attaching a [`CallerInfo`] to every request. An existing one
/// is left in place.
pub fn capture_caller(mut request: Request<()>) -> Result<Request<()>, Status> {
    if request.extensions().get::<CallerInfo>().is_none() {
        let info = CallerInfo::from_request(&request);
        request.extensions_mut().insert(info);
    }
    Ok(request)
}

/// First CN of a DER certificate's subject.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    #[test]
    fn reads_forwarded_headers() {
        let mut request = Request::new(());
        let md = request.metadata_mut();
        md.insert(COOKIE_HEADER, "abc".parse().unwrap());
        md.insert(REMOTE_ADDR_HEADER, "192.0.2.1".parse().unwrap());
        md.insert(REQUEST_ID_HEADER, "req-1".parse().unwrap());
        md.insert(HOSTNAME_HEADER, "render-7".parse().unwrap());

        let request = capture_caller(request).unwrap();
        let info = request.extensions().get::<CallerInfo>().unwrap();
        assert_eq!(info.forwarded_cookie.as_deref(), Some("abc"));
        assert_eq!(info.forwarded_addr.as_deref(), Some("192.0.2.1"));
        assert_eq!(info.request_id, "req-1");
        assert_eq!(info.hostname.as_deref(), Some("render-7"));
        assert!(info.peer_cn.is_none());
    }

    #[test]
    fn generates_request_id() {
        let request = capture_caller(Request::new(())).unwrap();
        let info = request.extensions().get::<CallerInfo>().unwrap();
        assert!(Uuid::parse_str(&info.request_id).is_ok());
        assert!(info.forwarded_cookie.is_none());
    }

    #[test]
    fn keeps_injected_caller() {
        let mut request = Request::new(());
        request.extensions_mut().insert(CallerInfo::with_cn("worker-1"));
        let request = capture_caller(request).unwrap();
        let info = request.extensions().get::<CallerInfo>().unwrap();
        assert_eq!(info.peer_cn.as_deref(), Some("worker-1"));
    }

    #[test]
    fn extracts_common_name() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "sub-123");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        assert_eq!(common_name(cert.der()).as_deref(), Some("sub-123"));
        assert_eq!(common_name(b"garbage"), None);
    }
}
