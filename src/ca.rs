//! Certificate authority and leaf forging
//!
//! Holds the CA key pair used to impersonate origins. The CA is loaded from
//! disk when both PEM files exist and generated (then persisted) otherwise.
//! `sign_host` forges a leaf certificate whose SAN list is exactly the names
//! it is given; names that parse as IP addresses become IP SANs.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{ProxyError, Result};

/// CA configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Path to the CA certificate PEM
    pub cert_path: String,

    /// Path to the CA private key PEM
    pub key_path: String,

    /// Organization name stamped on forged leaves
    pub organization: String,

    /// Leaf certificate validity in days
    pub validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: "ca.crt".to_string(),
            key_path: "ca.key".to_string(),
            organization: "Middleman Proxy".to_string(),
            validity_days: 90,
        }
    }
}

/// A forged leaf certificate ready for a TLS server configuration.
pub struct ForgedCert {
    /// The SAN list the leaf was forged for
    pub sans: Vec<String>,

    /// Leaf chain: `[leaf, ca]`
    pub chain: Vec<CertificateDer<'static>>,

    /// Leaf private key (PKCS#8)
    pub key: rustls::pki_types::PrivateKeyDer<'static>,

    /// The same material assembled for rustls cert resolution
    pub certified: Arc<CertifiedKey>,
}

impl std::fmt::Debug for ForgedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgedCert").field("sans", &self.sans).finish()
    }
}

/// Certificate authority for TLS interception.
///
/// Signs leaf certificates for intercepted hosts with a CA key pair the
/// client is expected to trust.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    config: CaConfig,
}

impl CertificateAuthority {
    /// Load the CA from disk if both files exist, otherwise generate a new
    /// one and persist it.
    pub fn load_or_generate(config: CaConfig) -> Result<Self> {
        let (ca_cert, ca_key) =
            if Path::new(&config.cert_path).exists() && Path::new(&config.key_path).exists() {
                info!(cert = %config.cert_path, "loading CA from disk");
                Self::load(&config)?
            } else {
                info!(cert = %config.cert_path, "generating new CA certificate");
                let (cert, key) = Self::generate(&config)?;
                Self::save(&config, &cert, &key)?;
                (cert, key)
            };

        Ok(Self {
            ca_cert,
            ca_key,
            config,
        })
    }

    /// Build a CA from in-memory PEMs (no filesystem access).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let (ca_cert, ca_key) = Self::parse_pem(cert_pem, key_pem)?;
        Ok(Self {
            ca_cert,
            ca_key,
            config: CaConfig::default(),
        })
    }

    /// Generate an ephemeral CA, e.g. for tests.
    pub fn ephemeral() -> Result<Self> {
        let config = CaConfig::default();
        let (ca_cert, ca_key) = Self::generate(&config)?;
        Ok(Self {
            ca_cert,
            ca_key,
            config,
        })
    }

    fn generate(config: &CaConfig) -> Result<(Certificate, KeyPair)> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, config.organization.clone());
        distinguished_name.push(DnType::CommonName, format!("{} CA", config.organization));
        params.distinguished_name = distinguished_name;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate()
            .map_err(|e| ProxyError::CaGenerationFailed(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::CaGenerationFailed(e.to_string()))?;

        Ok((cert, key_pair))
    }

    fn load(config: &CaConfig) -> Result<(Certificate, KeyPair)> {
        let cert_pem = fs::read_to_string(&config.cert_path)
            .map_err(|e| ProxyError::CaLoadFailed(format!("read {}: {e}", config.cert_path)))?;
        let key_pem = fs::read_to_string(&config.key_path)
            .map_err(|e| ProxyError::CaLoadFailed(format!("read {}: {e}", config.key_path)))?;
        Self::parse_pem(&cert_pem, &key_pem)
    }

    fn parse_pem(cert_pem: &str, key_pem: &str) -> Result<(Certificate, KeyPair)> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::CaLoadFailed(format!("parse private key: {e}")))?;

        // Re-signing the parsed parameters yields a Certificate usable as an
        // issuer; signing-relevant fields (subject, key identifiers) are
        // preserved from the PEM.
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| ProxyError::CaLoadFailed(format!("parse certificate: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::CaLoadFailed(format!("reconstruct certificate: {e}")))?;

        Ok((cert, key_pair))
    }

    fn save(config: &CaConfig, cert: &Certificate, key: &KeyPair) -> Result<()> {
        fs::write(&config.cert_path, cert.pem())
            .map_err(|e| ProxyError::CaGenerationFailed(format!("save certificate: {e}")))?;
        fs::write(&config.key_path, key.serialize_pem())
            .map_err(|e| ProxyError::CaGenerationFailed(format!("save private key: {e}")))?;
        info!(cert = %config.cert_path, key = %config.key_path, "CA persisted");
        Ok(())
    }

    /// CA certificate PEM, for installation in client trust stores.
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// CA certificate DER.
    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Forge a leaf certificate whose SAN list is exactly `sans`, signed by
    /// this CA. Concurrent forging for the same name is wasteful but
    /// harmless; the cache layer prevents it.
    pub fn sign_host(&self, sans: &[String]) -> Result<ForgedCert> {
        let host = sans.first().cloned().unwrap_or_default();
        let fail = |e: &dyn std::fmt::Display| ProxyError::cert_generation(&host, e);

        let mut params = CertificateParams::new(sans.to_vec()).map_err(|e| fail(&e))?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, self.config.organization.clone());
        distinguished_name.push(DnType::CommonName, host.clone());
        params.distinguished_name = distinguished_name;

        // Back-dated a day against clock skew
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(self.config.validity_days));

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.serial_number = Some(serial_number().into());

        let key_pair = KeyPair::generate().map_err(|e| fail(&e))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| fail(&e))?;

        let key: rustls::pki_types::PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
        let signing_key = any_supported_type(&key).map_err(|e| fail(&e))?;
        let chain = vec![cert.der().clone(), self.ca_cert.der().clone()];
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

        Ok(ForgedCert {
            sans: sans.to_vec(),
            chain,
            key,
            certified,
        })
    }
}

/// Unique serial: seconds since the epoch in the high half, random low half.
fn serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
    (u64::from(timestamp_part) << 32) | u64::from(random_part)
}
