use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};

use crate::clock::millis_to_datetime;
use crate::config::IssuerConfig;
use crate::error::{Result, SchedulerError};

/// A freshly issued client certificate and its private key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs short-lived worker client certificates with a local CA.
pub struct CertIssuer {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    validity: Duration,
}

impl std::fmt::Debug for CertIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertIssuer")
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl CertIssuer {
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str, validity_days: i64) -> Result<Self> {
        let invalid = |what: &str, e: rcgen::Error| {
            SchedulerError::FailedPrecondition(format!("issuing CA {}: {}", what, e))
        };
        let ca_key = KeyPair::from_pem(ca_key_pem).map_err(|e| invalid("key", e))?;
        let params =
            CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(|e| invalid("cert", e))?;
        // Re-sign the parsed parameters so rcgen can use them as an issuer.
        let ca_cert = params.self_signed(&ca_key).map_err(|e| invalid("cert", e))?;
        Ok(Self {
            ca_cert,
            ca_key,
            validity: Duration::days(validity_days.max(1)),
        })
    }

    pub async fn load(config: &IssuerConfig) -> Result<Self> {
        let cert = read_pem(&config.ca_cert_path).await?;
        let key = read_pem(&config.ca_key_path).await?;
        let issuer = Self::from_pem(&cert, &key, config.validity_days)?;
        tracing::info!(
            cert = %config.ca_cert_path.display(),
            validity_days = config.validity_days,
            "Loaded issuing CA"
        );
        Ok(issuer)
    }

    /// Issues a client-auth certificate whose CN is `subject`, valid from
    /// `now` for the configured number of days.
    pub fn issue(&self, subject: &str, now: DateTime<Utc>) -> Result<IssuedCert> {
        let internal = |e: rcgen::Error| SchedulerError::Internal(format!("issue cert: {}", e));

        let key = KeyPair::generate().map_err(internal)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(internal)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        // X.509 validity has second precision.
        let not_before = now.timestamp();
        let not_after = (now + self.validity).timestamp();
        params.not_before = offset_time(not_before)?;
        params.not_after = offset_time(not_after)?;

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(internal)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            expires_at: millis_to_datetime(not_after * 1000),
        })
    }
}

async fn read_pem(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        SchedulerError::FailedPrecondition(format!("read {}: {}", path.display(), e))
    })
}

fn offset_time(unix_secs: i64) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(unix_secs)
        .map_err(|e| SchedulerError::Internal(format!("certificate validity: {}", e)))
}
