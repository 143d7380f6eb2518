//! TLS certificate handling for HTTPS interception
//!
//! A root CA is loaded from (or generated into) a storage directory once.
//! Per-host leaf certificates are minted on demand, signed by the root, and
//! cached for the lifetime of the CA. Concurrent requests for the same host
//! share a single in-flight generation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::CertificateError;
use crate::http::crypto_provider;

/// Root validity (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity (1 year)
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdate not_before to tolerate client clock skew
const NOT_BEFORE_OFFSET_SECS: i64 = 60;

const ROOT_CERT_FILE: &str = "ca_cert.pem";
const ROOT_KEY_FILE: &str = "ca_key.pem";

/// Key type used for generated certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// 2048-bit RSA, accepted by every client
    #[default]
    Rsa2048,
    /// NIST P-256 ECDSA, much faster to generate
    EcdsaP256,
}

/// Export encoding for the root certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertFormat {
    Pem,
    Der,
}

/// A minted leaf certificate for one hostname
pub struct CertificateEntry {
    /// Hostname the certificate was issued for
    pub hostname: String,

    /// Leaf certificate PEM
    pub cert_pem: String,

    /// Leaf private key PEM (PKCS#8)
    pub key_pem: String,

    /// Leaf certificate DER
    pub cert_der: CertificateDer<'static>,

    /// When the certificate was minted
    pub issued_at: DateTime<Utc>,

    /// Ready-to-use TLS server configuration presenting this leaf
    server_config: Arc<rustls::ServerConfig>,
}

impl CertificateEntry {
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.server_config.clone()
    }
}

impl std::fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("hostname", &self.hostname)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Loaded root keypair and certificate
struct RootMaterial {
    /// Issuer view of the root used for signing
    cert: Certificate,
    key: KeyPair,
    /// Root certificate exactly as stored on disk
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Summary of the CA state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaInfo {
    pub exists: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cached_leaves: usize,
}

type LeafSlot = Arc<OnceCell<Arc<CertificateEntry>>>;

/// Certificate Authority for generating site certificates
pub struct CertificateAuthority {
    /// Directory holding the root PEM files
    storage_dir: PathBuf,

    /// Key type for new keys
    algorithm: KeyAlgorithm,

    /// Root material, `None` until `ensure_root`
    root: RwLock<Option<Arc<RootMaterial>>>,

    /// Leaf cache keyed by normalized hostname
    leaves: Mutex<HashMap<String, LeafSlot>>,
}

impl CertificateAuthority {
    /// Create a CA bound to a storage directory. Nothing is loaded until
    /// [`ensure_root`](Self::ensure_root) runs.
    pub fn new(storage_dir: impl Into<PathBuf>, algorithm: KeyAlgorithm) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            algorithm,
            root: RwLock::new(None),
            leaves: Mutex::new(HashMap::new()),
        }
    }

    fn cert_path(&self) -> PathBuf {
        self.storage_dir.join(ROOT_CERT_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.storage_dir.join(ROOT_KEY_FILE)
    }

    /// Load the root from storage, generating and persisting one if absent
    pub fn ensure_root(&self) -> Result<(), CertificateError> {
        if self.root.read().is_some() {
            return Ok(());
        }

        let mut root = self.root.write();
        if root.is_some() {
            return Ok(());
        }

        let (cert_path, key_path) = (self.cert_path(), self.key_path());
        let material = if cert_path.exists() && key_path.exists() {
            tracing::info!("Loading CA from {}", self.storage_dir.display());
            load_root(&cert_path, &key_path)?
        } else {
            tracing::info!("Generating new CA in {}", self.storage_dir.display());
            let material = generate_root(self.algorithm)?;
            persist_root(&self.storage_dir, &cert_path, &key_path, &material)?;
            material
        };

        *root = Some(Arc::new(material));
        Ok(())
    }

    /// Return the cached leaf for `hostname`, minting it on first use
    pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<CertificateEntry>, CertificateError> {
        let host = normalize_host(hostname);
        if host.is_empty() {
            return Err(CertificateError::InvalidHostname(hostname.to_string()));
        }

        let root = self.root.read().clone().ok_or(CertificateError::RootMissing)?;
        let slot = self.leaves.lock().entry(host.clone()).or_default().clone();

        let algorithm = self.algorithm;
        let entry = slot
            .get_or_try_init(|| async move {
                tracing::debug!("Minting leaf certificate for {}", host);
                let name = host.clone();
                tokio::task::spawn_blocking(move || mint_leaf(&root, &name, algorithm))
                    .await
                    .map_err(|e| CertificateError::Generation {
                        host,
                        reason: e.to_string(),
                    })?
                    .map(Arc::new)
            })
            .await?;

        Ok(entry.clone())
    }

    /// Root certificate as PEM text or DER bytes
    pub fn export_root(&self, format: CertFormat) -> Result<Vec<u8>, CertificateError> {
        let root = self.root.read().clone().ok_or(CertificateError::RootMissing)?;
        Ok(match format {
            CertFormat::Pem => root.cert_pem.clone().into_bytes(),
            CertFormat::Der => root.cert_der.to_vec(),
        })
    }

    /// Root certificate PEM, if loaded
    pub fn root_pem(&self) -> Option<String> {
        self.root.read().as_ref().map(|r| r.cert_pem.clone())
    }

    /// Discard the root and every cached leaf, then generate a fresh root
    pub fn regenerate(&self) -> Result<(), CertificateError> {
        {
            let mut root = self.root.write();
            *root = None;
            self.leaves.lock().clear();

            for path in [self.cert_path(), self.key_path()] {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(storage_error(&path, e));
                    }
                }
            }
        }

        tracing::info!("Regenerating CA");
        self.ensure_root()
    }

    /// Existence, timestamps and cache size
    pub fn info(&self) -> CaInfo {
        let root = self.root.read();
        CaInfo {
            exists: root.is_some(),
            created_at: root.as_ref().map(|r| r.created_at),
            expires_at: root.as_ref().map(|r| r.expires_at),
            cert_path: self.cert_path(),
            key_path: self.key_path(),
            cached_leaves: self.leaf_count(),
        }
    }

    /// Number of hostnames with a cache slot
    pub fn leaf_count(&self) -> usize {
        self.leaves
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

/// Lowercase, strip any port and IPv6 brackets
fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    host.split(':').next().unwrap_or_default().to_string()
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> CertificateError {
    CertificateError::Storage {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn generation_error(host: &str, e: impl std::fmt::Display) -> CertificateError {
    CertificateError::Generation {
        host: host.to_string(),
        reason: e.to_string(),
    }
}

fn to_chrono(t: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair, rcgen::Error> {
    match algorithm {
        KeyAlgorithm::Rsa2048 => {
            use rsa::pkcs8::{EncodePrivateKey, LineEnding};

            // ring can sign with RSA but not generate it
            let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                .map_err(|_| rcgen::Error::KeyGenerationUnavailable)?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|_| rcgen::Error::KeyGenerationUnavailable)?;
            KeyPair::from_pem(&pem)
        }
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
    }
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Pincer Proxy CA");
    dn.push(DnType::OrganizationName, "Pincer");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);
    params
}

fn generate_root(algorithm: KeyAlgorithm) -> Result<RootMaterial, CertificateError> {
    let key = generate_key(algorithm).map_err(|e| generation_error("root", e))?;
    let params = root_params();
    let (created_at, expires_at) = (to_chrono(params.not_before), to_chrono(params.not_after));
    let cert = params.self_signed(&key).map_err(|e| generation_error("root", e))?;

    Ok(RootMaterial {
        cert_pem: cert.pem(),
        cert_der: cert.der().clone(),
        created_at,
        expires_at,
        cert,
        key,
    })
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<RootMaterial, CertificateError> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|e| storage_error(cert_path, e))?;
    let key_pem = fs::read_to_string(key_path).map_err(|e| storage_error(key_path, e))?;

    let key = KeyPair::from_pem(&key_pem).map_err(|e| storage_error(key_path, e))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| storage_error(cert_path, e))?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
        .map_err(|e| storage_error(cert_path, e))?;

    // Rebuild an issuer with the stored subject and key; the stored PEM
    // remains the certificate handed to clients.
    let (created_at, expires_at) = (to_chrono(params.not_before), to_chrono(params.not_after));
    let cert = params.self_signed(&key).map_err(|e| storage_error(cert_path, e))?;

    Ok(RootMaterial {
        cert,
        key,
        cert_pem,
        cert_der,
        created_at,
        expires_at,
    })
}

fn persist_root(
    dir: &Path,
    cert_path: &Path,
    key_path: &Path,
    material: &RootMaterial,
) -> Result<(), CertificateError> {
    fs::create_dir_all(dir).map_err(|e| storage_error(dir, e))?;
    fs::write(cert_path, material.cert_pem.as_bytes()).map_err(|e| storage_error(cert_path, e))?;
    write_private(key_path, material.key.serialize_pem().as_bytes())
        .map_err(|e| storage_error(key_path, e))?;
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

fn mint_leaf(
    root: &RootMaterial,
    host: &str,
    algorithm: KeyAlgorithm,
) -> Result<CertificateEntry, CertificateError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
    } else {
        let wildcard = format!("*.{}", host);
        params.subject_alt_names = vec![
            SanType::DnsName(host.try_into().map_err(|e| generation_error(host, e))?),
            SanType::DnsName(wildcard.as_str().try_into().map_err(|e| generation_error(host, e))?),
        ];
    }

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.use_authority_key_identifier_extension = true;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let key = generate_key(algorithm).map_err(|e| generation_error(host, e))?;
    let cert = params
        .signed_by(&key, &root.cert, &root.key)
        .map_err(|e| generation_error(host, e))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

    let mut server_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| CertificateError::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone(), root.cert_der.clone()], key_der)
        .map_err(|e| CertificateError::TlsConfig(e.to_string()))?;

    // HTTP/2 is not intercepted
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CertificateEntry {
        hostname: host.to_string(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der,
        issued_at: Utc::now(),
        server_config: Arc::new(server_config),
    })
}
