//! Certificate authority for HTTPS interception
//!
//! Owns the persisted root key and certificate, mints per-hostname leaf
//! certificates on demand, and caches them. Concurrent requests for the
//! same hostname are coalesced into a single minting operation.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{Error, Result};

/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live: half the leaf validity, so a cached leaf is never
/// served near expiry
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Backdate for not_before to tolerate client clock skew (60 seconds)
const NOT_BEFORE_SKEW_SECS: i64 = 60;
/// Root certificate validity (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Maximum number of cached leaves
const CACHE_CAPACITY: u64 = 1000;

const ROOT_CERT_FILE: &str = "ca.crt";
const ROOT_KEY_FILE: &str = "ca.key";

/// A minted leaf: certificate chain `[leaf, root]` plus the leaf key.
pub type LeafCert = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// The root certificate authority.
///
/// The root private key is owned here and never handed out; callers only
/// ever see leaf keys and the root certificate.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  root_pem: String,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root from `storage_path`, or generate and persist a new one.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
      restrict_dir_permissions(&storage_path).await?;
    }
    let cert_path = storage_path.join(ROOT_CERT_FILE);
    let key_path = storage_path.join(ROOT_KEY_FILE);

    let (issuer, root_der, root_pem) = if cert_path.exists() && key_path.exists() {
      Self::load_root(&cert_path, &key_path).await?
    } else {
      Self::generate_root(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      root_der,
      root_pem,
      storage_path,
    })
  }

  async fn load_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to load root certificate: {}", e)))?;

    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate in root pem"))?
      .map_err(|e| Error::certificate(format!("failed to parse root pem: {}", e)))?;

    Ok((issuer, root_der, cert_pem))
  }

  async fn generate_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Waylay Root CA");
    dn.push(DnType::OrganizationName, "Waylay");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate root key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign root: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    write_private(cert_path, cert_pem.as_bytes()).await?;
    write_private(key_path, key_pem.as_bytes()).await?;
    tracing::info!(path = %cert_path.display(), "generated new root certificate");

    let root_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer: {}", e)))?;

    Ok((issuer, root_der, cert_pem))
  }

  /// Mint a leaf certificate for `host` (DNS name or IP literal).
  fn mint_leaf(&self, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.root_der.clone()], key_der))
  }

  /// The root certificate in PEM form, for installation in client trust
  /// stores.
  pub fn root_cert_pem(&self) -> &str {
    &self.root_pem
  }

  /// Path of the persisted root certificate.
  pub fn root_cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CERT_FILE)
  }
}

async fn write_private(path: &Path, data: &[u8]) -> Result<()> {
  let mut file = fs::File::create(path).await?;
  file.write_all(data).await?;
  file.flush().await?;
  restrict_file_permissions(path).await?;
  Ok(())
}

#[cfg(unix)]
async fn restrict_file_permissions(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn restrict_file_permissions(_path: &Path) -> Result<()> {
  Ok(())
}

#[cfg(unix)]
async fn restrict_dir_permissions(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn restrict_dir_permissions(_path: &Path) -> Result<()> {
  Ok(())
}

/// Caching front of the certificate authority.
///
/// `get_or_create` is the only way interception code obtains a leaf. The
/// cache coalesces concurrent misses per hostname, so N simultaneous
/// handshakes for one host trigger exactly one minting operation.
pub struct CertificateStore {
  ca: CertificateAuthority,
  cache: Cache<String, Arc<LeafCert>>,
  minted: AtomicU64,
}

impl CertificateStore {
  /// Create a store backed by the root at `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();
    Ok(Self {
      ca,
      cache,
      minted: AtomicU64::new(0),
    })
  }

  /// Return the cached leaf for `host`, minting one if needed.
  pub async fn get_or_create(&self, host: &str) -> Result<LeafCert> {
    let entry = self
      .cache
      .try_get_with(host.to_string(), async {
        self.minted.fetch_add(1, Ordering::Relaxed);
        self.ca.mint_leaf(host).map(Arc::new)
      })
      .await
      .map_err(|e: Arc<Error>| Error::certificate(e.to_string()))?;
    let (chain, key) = entry.as_ref();
    Ok((chain.clone(), key.clone_key()))
  }

  /// Number of minting operations performed so far.
  pub fn minted(&self) -> u64 {
    self.minted.load(Ordering::Relaxed)
  }

  /// The root certificate in PEM form.
  pub fn root_cert_pem(&self) -> &str {
    self.ca.root_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn root_cert_path(&self) -> PathBuf {
    self.ca.root_cert_path()
  }
}
