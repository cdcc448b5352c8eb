//! TLS credential material.
//!
//! Either loads a PEM certificate/key pair from disk or generates a
//! long-lived self-signed ECDSA certificate at startup. The result is turned
//! into a single `rustls::ServerConfig` shared by every handshake.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::CredentialError;

/// Subject common name and organization of generated certificates.
pub const GENERATED_SUBJECT: &str = "plfm-frontdoor";

/// Generated certificates are backdated to tolerate clock skew.
pub const BACKDATE: Duration = Duration::hours(48);

/// Validity of generated certificates (about a century).
pub const VALIDITY: Duration = Duration::days(365 * 100);

/// Where credential material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Load a PEM certificate chain and private key.
    Files { cert: PathBuf, key: PathBuf },
    /// Generate a self-signed certificate for the given names.
    Generate { subject_alt_names: Vec<String> },
}

impl CredentialSource {
    /// Pick a source from optional file paths. Both paths are required to
    /// load from disk; a lone path is ignored with a warning.
    pub fn from_paths(
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        subject_alt_names: Vec<String>,
    ) -> Self {
        match (cert, key) {
            (Some(cert), Some(key)) => Self::Files { cert, key },
            (None, None) => Self::Generate { subject_alt_names },
            (cert, key) => {
                warn!(
                    cert = ?cert,
                    key = ?key,
                    "Both cert and key are required to load TLS material; generating instead"
                );
                Self::Generate { subject_alt_names }
            }
        }
    }
}

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct CredentialMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CredentialMaterial {
    /// Load or generate material according to `source`.
    pub fn from_source(source: &CredentialSource) -> Result<Self, CredentialError> {
        match source {
            CredentialSource::Files { cert, key } => Self::load(cert, key),
            CredentialSource::Generate { subject_alt_names } => {
                Self::generate(subject_alt_names)
            }
        }
    }

    /// Load a PEM certificate chain and the first private key in `key_path`.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CredentialError> {
        let mut cert_reader = open(cert_path)?;
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CredentialError::Read {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if cert_chain.is_empty() {
            return Err(CredentialError::NoCertificates(cert_path.to_path_buf()));
        }

        let mut key_reader = open(key_path)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|source| CredentialError::Read {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| CredentialError::NoPrivateKey(key_path.to_path_buf()))?;

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            chain_len = cert_chain.len(),
            "Loaded TLS credentials"
        );

        Ok(Self { cert_chain, key })
    }

    /// Generate an ECDSA P-256 key and a self-signed, non-CA certificate
    /// valid for server and client authentication.
    pub fn generate(subject_alt_names: &[String]) -> Result<Self, CredentialError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, GENERATED_SUBJECT);
        subject.push(DnType::OrganizationName, GENERATED_SUBJECT);
        params.distinguished_name = subject;

        params.subject_alt_names = subject_alt_names
            .iter()
            .map(|name| -> Result<SanType, rcgen::Error> {
                match name.parse() {
                    Ok(ip) => Ok(SanType::IpAddress(ip)),
                    Err(_) => Ok(SanType::DnsName(name.clone().try_into()?)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + VALIDITY;
        params.serial_number = Some(SerialNumber::from(serial_from_clock().to_be_bytes().to_vec()));

        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let not_after = params.not_after;
        let cert = params.self_signed(&key_pair)?;

        info!(
            subject = GENERATED_SUBJECT,
            not_after = %not_after,
            "Generated self-signed TLS certificate"
        );

        Ok(Self {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// Certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// DER encoding of the leaf certificate.
    pub fn leaf_der(&self) -> &[u8] {
        self.cert_chain[0].as_ref()
    }

    /// Build the server configuration used to terminate TLS.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CredentialError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Positive serial number derived from the wall clock (100µs resolution).
fn serial_from_clock() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    ((nanos / 100_000) as u64).max(1)
}
