//! Local root certificate authority
//!
//! The root CA is loaded from, or generated into, the configured CA
//! directory exactly once at startup and then handed to the certificate
//! provider. Clients must trust `rootCA.crt` for interception to go
//! unnoticed.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509NameBuilder, X509};

use crate::common::{ProxyError, Result};

/// Root certificate file name inside the CA directory
pub const CA_CERT_FILE: &str = "rootCA.crt";

/// Root private key file name inside the CA directory
pub const CA_KEY_FILE: &str = "rootCA.key";

/// Common name of generated root certificates
pub const CA_COMMON_NAME: &str = "Fake Corp Proxy Root CA";

/// Organization written into every certificate this proxy issues
pub const ORGANIZATION: &str = "Fake Corp Proxy";

const CA_VALIDITY_DAYS: u32 = 3650;

/// Root CA used to sign leaf certificates
pub struct RootAuthority {
    cert: X509,
    key: PKey<Private>,
    cert_path: PathBuf,
}

impl RootAuthority {
    /// Load the root CA from `dir`, generating and saving it on first use
    ///
    /// # Parameters
    ///
    /// * `dir` - CA directory, created if missing
    ///
    /// # Errors
    ///
    /// Returns an error if existing files cannot be parsed or new ones
    /// cannot be written.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.is_file() && key_path.is_file() {
            debug!("Loading root CA from {}", cert_path.display());
            let cert = X509::from_pem(&fs::read(&cert_path)?)
                .map_err(|e| ProxyError::Certificate(format!("Failed to parse root CA certificate: {}", e)))?;
            let key = PKey::private_key_from_pem(&fs::read(&key_path)?)
                .map_err(|e| ProxyError::Certificate(format!("Failed to parse root CA key: {}", e)))?;

            if !cert.public_key()?.public_eq(&key) {
                return Err(ProxyError::Certificate(format!(
                    "Root CA key {} does not match {}",
                    key_path.display(),
                    cert_path.display()
                )));
            }

            return Ok(Self { cert, key, cert_path });
        }

        info!("Generating a new root CA in {}", dir.display());
        let (cert, key) = generate_root()?;

        fs::create_dir_all(dir)?;
        write_private(&key_path, &key.private_key_to_pem_pkcs8()?)?;
        fs::write(&cert_path, cert.to_pem()?)?;

        Ok(Self { cert, key, cert_path })
    }

    /// Root certificate
    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    /// Root private key
    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Where the root certificate lives on disk
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// SHA-256 fingerprint of the root certificate, colon separated
    pub fn fingerprint(&self) -> Result<String> {
        let digest = self.cert.digest(MessageDigest::sha256())?;
        Ok(digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<String>>()
            .join(":"))
    }
}

/// Generate a fresh P-256 private key
pub(crate) fn generate_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

/// Random positive 128-bit serial number
pub(crate) fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

/// Subject name with the proxy's organization and the given common name
pub(crate) fn subject_name(common_name: &str) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn generate_root() -> Result<(X509, PKey<Private>)> {
    let key = generate_key()?;
    let name = subject_name(CA_COMMON_NAME)?;

    let serial = random_serial()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CA_VALIDITY_DAYS)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    let subject_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build(), key))
}

/// Write key material readable by the owner only
pub(crate) fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();

        let generated = RootAuthority::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).is_file());
        assert!(dir.path().join(CA_KEY_FILE).is_file());

        let loaded = RootAuthority::load_or_generate(dir.path()).unwrap();
        assert_eq!(generated.fingerprint().unwrap(), loaded.fingerprint().unwrap());
        assert_eq!(loaded.cert_path(), dir.path().join(CA_CERT_FILE));
    }

    #[test]
    fn test_root_is_self_signed_ca() {
        let dir = tempfile::tempdir().unwrap();
        let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
        let cert = authority.certificate();

        assert!(cert.verify(authority.private_key()).unwrap());
        let cn = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, CA_COMMON_NAME);
    }

    #[test]
    fn test_fingerprint_format() {
        let dir = tempfile::tempdir().unwrap();
        let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
        let fingerprint = authority.fingerprint().unwrap();
        assert_eq!(fingerprint.split(':').count(), 32);
    }
}
