//! Certificate authority used to impersonate upstream servers
//!
//! The root certificate is generated once and kept next to the captures so
//! the browser only has to trust it once. Leaf certificates are generated on
//! demand and cached per host.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// File name of the generated root certificate
pub const CA_CERT_FILE: &str = "ca.crt";
/// File name of the generated root key
pub const CA_KEY_FILE: &str = "ca.key";

/// Leaf certificate validity (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cached leaves are dropped well before they expire
const CACHE_TTL: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Backdate leaves to tolerate clock skew
const NOT_BEFORE_OFFSET: i64 = 60;

type LeafCert = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Root CA plus a cache of the leaf certificates it signed
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  ca_cert_path: PathBuf,
  leaves: Cache<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
  /// Load `ca.crt`/`ca.key` from `dir`, generating them first if missing
  pub fn load_or_generate(dir: &Path) -> Result<Self> {
    fs::create_dir_all(dir)?;
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);
    if !(cert_path.exists() && key_path.exists()) {
      let (cert_pem, key_pem) = generate_root()?;
      fs::write(&cert_path, cert_pem)?;
      fs::write(&key_path, key_pem)?;
      tracing::info!("Generated root certificate {}", cert_path.display());
    }
    Self::from_files(&cert_path, &key_path)
  }

  /// Use a caller supplied PEM certificate and key
  pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read_to_string(key_path).map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", key_path.display(), e))
    })?;
    let mut ca = Self::from_pem(&cert_pem, &key_pem)?;
    ca.ca_cert_path = cert_path.to_path_buf();
    Ok(ca)
  }

  fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to load CA certificate: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;
    let leaves = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      ca_cert_path: PathBuf::new(),
      leaves,
    })
  }

  /// Root certificate in PEM format, for installing into a trust store
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Where the root certificate was loaded from
  pub fn ca_cert_path(&self) -> &Path {
    &self.ca_cert_path
  }

  /// TLS server configuration impersonating `host`
  pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    if let Some(config) = self.leaves.get(host).await {
      return Ok(config);
    }
    let (chain, key) = self.generate_leaf(host)?;
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
    let config = Arc::new(config);
    self.leaves.insert(host.to_string(), config.clone()).await;
    Ok(config)
  }

  fn generate_leaf(&self, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    // IP literals get both SAN kinds, clients disagree on which one they check
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(name) = host.try_into() {
        sans.push(SanType::DnsName(name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid host name: {}", host))
      })?)]
    };
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign certificate: {}", e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;
    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key,
    ))
  }
}

fn generate_root() -> Result<(String, String)> {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Slinger Wire CA");
  dn.push(DnType::OrganizationName, "Slinger Wire");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::days(3650);

  let key_pair = KeyPair::generate()
    .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
  Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::CertificateInfo;

  #[test]
  fn test_generated_once() {
    let dir = tempfile::tempdir().unwrap();
    let first = CertificateAuthority::load_or_generate(dir.path()).unwrap();
    let second = CertificateAuthority::load_or_generate(dir.path()).unwrap();
    assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    assert!(first.ca_cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(first.ca_cert_path(), dir.path().join(CA_CERT_FILE));
  }

  #[test]
  fn test_leaf_is_signed_for_host() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
    let (chain, _) = ca.generate_leaf("example.com").unwrap();
    assert_eq!(chain.len(), 2);
    let info = CertificateInfo::from_der(&chain[0]).unwrap();
    assert_eq!(info.common_name.as_deref(), Some("example.com"));
    assert!(info.alt_names.contains(&"example.com".to_string()));
    assert!(!info.expired);
    let (chain, _) = ca.generate_leaf("127.0.0.1").unwrap();
    assert_eq!(chain.len(), 2);
  }

  #[test]
  fn test_certificate_details() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
    let (chain, _) = ca.generate_leaf("127.0.0.1").unwrap();
    let leaf = CertificateInfo::from_der(&chain[0]).unwrap();
    assert!(leaf.alt_names.contains(&"127.0.0.1".to_string()));
    assert_eq!(leaf.key_algorithm, "EC");
    assert!(leaf.not_before < leaf.not_after);

    let root = CertificateInfo::from_der(&chain[1]).unwrap();
    assert_eq!(root.organization.as_deref(), Some("Slinger Wire"));
    assert_eq!(root.common_name.as_deref(), Some("Slinger Wire CA"));
    assert!(leaf.issuer.contains("Slinger Wire CA"));

    assert!(matches!(CertificateInfo::from_der(b"not a certificate"), Err(Error::Certificate(_))));
  }

  #[tokio::test]
  async fn test_server_config_cached() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
    let a = ca.server_config("example.com").await.unwrap();
    let b = ca.server_config("example.com").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn test_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let result = CertificateAuthority::from_files(&dir.path().join("x.crt"), &dir.path().join("x.key"));
    assert!(matches!(result, Err(Error::Certificate(_))));
  }
}
