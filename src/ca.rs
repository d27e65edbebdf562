//! Root certificate authority for TLS interception.
//!
//! The root CA is generated once at a well-known local path and reused across
//! restarts; browsers that trust it will accept the per-host leaf
//! certificates the interception engine mints from it.

use crate::error::ProxyError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

pub struct CertificateAuthority {
    ca_cert: Certificate,
    cert_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA found in `ca_dir`, or generate and save a new one.
    pub fn open(ca_dir: &Path) -> Result<Self> {
        let cert_path = ca_dir.join("ca.pem");
        let key_path = ca_dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            fs::create_dir_all(ca_dir)?;
            Self::generate_and_save(&cert_path, &key_path)
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let key_pem = fs::read_to_string(key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::Certificate(format!("Failed to parse CA key: {}", e)))?;

        // rcgen cannot sign with a parsed certificate, so the CA cert is
        // rebuilt from the persisted key with the same parameters.
        let mut params = Self::ca_params();
        params.key_pair = Some(key_pair);
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to recreate CA cert: {}", e)))?;

        Ok(Self {
            ca_cert,
            cert_path: cert_path.to_path_buf(),
        })
    }

    fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut params = Self::ca_params();
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        params.key_pair = Some(key_pair);

        let ca_cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("Failed to generate CA cert: {}", e)))?;

        let cert_pem = ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))?;
        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, ca_cert.serialize_private_key_pem())?;
        // .crt copy for systems that only import that extension
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;

        Ok(Self {
            ca_cert,
            cert_path: cert_path.to_path_buf(),
        })
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Recording Proxy CA");
        dn.push(DnType::OrganizationName, "Recording Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params
    }

    /// Path of the persisted root certificate, for the download endpoint.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    /// Root certificate in DER, for the rustls-backed interception engine.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.ca_cert
            .serialize_der()
            .map_err(|e| ProxyError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    /// Private key in DER, for the rustls-backed interception engine.
    pub fn key_der(&self) -> Vec<u8> {
        self.ca_cert.serialize_private_key_der()
    }
}
