//! Per-hostname leaf certificates
//!
//! Leaf certificates are issued on demand, signed by the root CA, and kept
//! in memory and under the certificate directory so that restarts reuse
//! them. Issuance happens outside the cache lock; two concurrent misses
//! for the same name may both issue, and the first one stored wins.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslContext, SslMethod};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::X509;

use super::ca::{generate_key, random_serial, subject_name, write_private, RootAuthority};
use crate::common::{ProxyError, Result};

const LEAF_VALIDITY_DAYS: u32 = 365;

/// A leaf key and certificate issued for one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Hostname or IP literal the certificate is valid for
    pub hostname: String,
    /// PKCS#8 private key in PEM
    pub key_pem: String,
    /// Certificate in PEM
    pub cert_pem: String,
}

impl CertificateRecord {
    /// Parsed certificate
    pub fn certificate(&self) -> Result<X509> {
        X509::from_pem(self.cert_pem.as_bytes())
            .map_err(|e| ProxyError::Certificate(format!("Invalid certificate for {}: {}", self.hostname, e)))
    }

    /// Parsed private key
    pub fn private_key(&self) -> Result<PKey<Private>> {
        PKey::private_key_from_pem(self.key_pem.as_bytes())
            .map_err(|e| ProxyError::Certificate(format!("Invalid key for {}: {}", self.hostname, e)))
    }
}

/// Issues and caches leaf certificates signed by the root CA
pub struct CertificateProvider {
    authority: Arc<RootAuthority>,
    store: Option<PathBuf>,
    cache: Mutex<HashMap<String, Arc<CertificateRecord>>>,
}

impl CertificateProvider {
    /// Create a provider signing with `authority`
    ///
    /// # Parameters
    ///
    /// * `authority` - Root CA
    /// * `store` - Directory for issued certificates; `None` keeps them in memory only
    pub fn new(authority: Arc<RootAuthority>, store: Option<PathBuf>) -> Self {
        Self {
            authority,
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Root CA used for signing
    pub fn authority(&self) -> &RootAuthority {
        &self.authority
    }

    /// Certificate already held in memory for `name`
    pub fn cached(&self, name: &str) -> Option<Arc<CertificateRecord>> {
        let key = normalize(name);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Return the certificate for `name`, loading or issuing it if needed
    ///
    /// This may block on key generation and disk I/O; async callers use
    /// [`CertificateProvider::fetch`].
    pub fn get_certificate(&self, name: &str) -> Result<Arc<CertificateRecord>> {
        if let Some(record) = self.cached(name) {
            return Ok(record);
        }

        let hostname = normalize(name);
        validate_hostname(&hostname)?;

        let record = match self.load_from_store(&hostname) {
            Some(record) => record,
            None => {
                let record = self.issue(&hostname)?;
                self.save_to_store(&record);
                record
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let record = cache
            .entry(hostname)
            .or_insert_with(|| Arc::new(record))
            .clone();
        Ok(record)
    }

    /// Async wrapper around [`CertificateProvider::get_certificate`]
    ///
    /// Cache hits return immediately; misses run on the blocking pool.
    pub async fn fetch(self: &Arc<Self>, name: &str) -> Result<Arc<CertificateRecord>> {
        if let Some(record) = self.cached(name) {
            return Ok(record);
        }

        let provider = Arc::clone(self);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || provider.get_certificate(&name))
            .await
            .map_err(|e| ProxyError::Other(format!("Certificate task failed: {}", e)))?
    }

    /// Build a server TLS context presenting `record`
    pub fn server_context(&self, record: &CertificateRecord) -> Result<SslContext> {
        let mut builder = SslContext::builder(SslMethod::tls_server())?;
        let cert = record.certificate()?;
        let key = record.private_key()?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder.add_extra_chain_cert(self.authority.certificate().clone())?;
        builder.check_private_key()?;
        Ok(builder.build())
    }

    fn issue(&self, hostname: &str) -> Result<CertificateRecord> {
        debug!("Issuing certificate for {}", hostname);

        let key = generate_key()?;
        let ca = self.authority.certificate();

        // CN is capped at 64 characters; the SAN carries the full name
        let common_name = &hostname[..hostname.len().min(64)];
        let subject = subject_name(common_name)?;
        let serial = random_serial()?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(ca.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let mut san = SubjectAlternativeName::new();
        if hostname.parse::<IpAddr>().is_ok() {
            san.ip(hostname);
        } else {
            san.dns(hostname);
        }
        let san = san.build(&builder.x509v3_context(Some(ca), None))?;
        builder.append_extension(san)?;

        let subject_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca), None))?;
        builder.append_extension(subject_key_id)?;
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(Some(ca), None))?;
        builder.append_extension(authority_key_id)?;

        builder.sign(self.authority.private_key(), MessageDigest::sha256())?;
        let cert = builder.build();

        Ok(CertificateRecord {
            hostname: hostname.to_string(),
            key_pem: pem_string(key.private_key_to_pem_pkcs8()?)?,
            cert_pem: pem_string(cert.to_pem()?)?,
        })
    }

    fn paths(&self, hostname: &str) -> Option<(PathBuf, PathBuf)> {
        let dir = self.store.as_deref()?;
        let stem = file_stem(hostname);
        Some((dir.join(format!("{}.crt", stem)), dir.join(format!("{}.key", stem))))
    }

    fn load_from_store(&self, hostname: &str) -> Option<CertificateRecord> {
        let (cert_path, key_path) = self.paths(hostname)?;
        if !cert_path.is_file() || !key_path.is_file() {
            return None;
        }

        let record = CertificateRecord {
            hostname: hostname.to_string(),
            cert_pem: fs::read_to_string(&cert_path).ok()?,
            key_pem: fs::read_to_string(&key_path).ok()?,
        };

        // Stale files from another root CA are reissued
        let signed_by_ca = record
            .certificate()
            .and_then(|cert| Ok(cert.verify(self.authority.private_key())?))
            .unwrap_or(false);
        if !signed_by_ca || record.private_key().is_err() {
            warn!("Ignoring unusable stored certificate {}", cert_path.display());
            return None;
        }

        debug!("Loaded certificate for {} from {}", hostname, cert_path.display());
        Some(record)
    }

    fn save_to_store(&self, record: &CertificateRecord) {
        let Some((cert_path, key_path)) = self.paths(&record.hostname) else {
            return;
        };

        let saved = cert_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .map_err(ProxyError::from)
            .and_then(|_| write_private(&key_path, record.key_pem.as_bytes()))
            .and_then(|_| Ok(fs::write(&cert_path, &record.cert_pem)?));

        match saved {
            Ok(()) => info!("Certificate for {} saved to {}", record.hostname, cert_path.display()),
            Err(e) => warn!("Could not save certificate for {}: {}", record.hostname, e),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Reject names that cannot be a DNS name or IP literal
fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && (hostname.parse::<IpAddr>().is_ok()
            || hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*')));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::Certificate(format!("Invalid hostname for certificate: {:?}", hostname)))
    }
}

fn file_stem(hostname: &str) -> String {
    hostname.replace('*', "%2A").replace(':', "%3A")
}

fn pem_string(pem: Vec<u8>) -> Result<String> {
    String::from_utf8(pem).map_err(|e| ProxyError::Certificate(format!("PEM is not UTF-8: {}", e)))
}
