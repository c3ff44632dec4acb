//! Certificate handling and parsing
//!
//! Summaries of X.509 certificates, SHA-256 fingerprints used as identity,
//! and the `ClientCertificate` credential (certificate plus private key).

use super::config::TlsError;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509NameRef, X509Ref, X509};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: Self::get_cn(cert.subject_name()),
            issuer: Self::get_cn(cert.issuer_name()),
            subject_alt_names: Self::get_subject_alt_names(cert),
        }
    }

    /// Get Common Name from X509_NAME
    fn get_cn(name: &X509NameRef) -> String {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<undef>".to_string())
    }

    fn get_subject_alt_names(cert: &X509Ref) -> Vec<String> {
        let mut names = Vec::new();

        if let Some(san_ext) = cert.subject_alt_names() {
            for name in san_ext {
                if let Some(dns) = name.dnsname() {
                    names.push(format!("DNS:{}", dns));
                } else if let Some(ip) = name.ipaddress() {
                    if let Ok(v4) = <[u8; 4]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv4Addr::from(v4)));
                    } else if let Ok(v6) = <[u8; 16]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv6Addr::from(v6)));
                    }
                }
            }
        }

        names
    }
}

/// SHA-256 digest of a certificate's DER encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertFingerprint([u8; 32]);

impl CertFingerprint {
    pub fn of(cert: &X509Ref) -> Result<Self, TlsError> {
        let digest = cert.digest(MessageDigest::sha256())?;
        let bytes = <[u8; 32]>::try_from(&digest[..])
            .map_err(|_| TlsError::Certificate("unexpected SHA-256 digest length".to_string()))?;
        Ok(CertFingerprint(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertFingerprint({})", self)
    }
}

/// What a session remembers about the certificate bound to its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    pub fingerprint: CertFingerprint,
    pub info: CertInfo,
}

/// Certificate presented by the server
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    info: CertInfo,
    fingerprint: CertFingerprint,
    der: Vec<u8>,
}

impl PeerCertificate {
    pub fn from_x509(cert: &X509Ref) -> Result<Self, TlsError> {
        Ok(PeerCertificate {
            info: CertInfo::from_x509(cert),
            fingerprint: CertFingerprint::of(cert)?,
            der: cert.to_der()?,
        })
    }

    pub fn info(&self) -> &CertInfo {
        &self.info
    }

    pub fn fingerprint(&self) -> CertFingerprint {
        self.fingerprint
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Client credential: X.509 certificate plus its private key
pub struct ClientCertificate {
    cert: X509,
    key: PKey<Private>,
    identity: CertIdentity,
}

impl ClientCertificate {
    /// Build from a certificate and key, verifying that they belong together
    pub fn new(cert: X509, key: PKey<Private>) -> Result<Self, TlsError> {
        let public = cert.public_key()?;
        if !public.public_eq(&key) {
            return Err(TlsError::Certificate(
                "private key does not match certificate".to_string(),
            ));
        }
        let identity = CertIdentity {
            fingerprint: CertFingerprint::of(&cert)?,
            info: CertInfo::from_x509(&cert),
        };
        Ok(ClientCertificate {
            cert,
            key,
            identity,
        })
    }

    /// Load from a PEM bundle holding both the certificate and the key
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        Self::from_pem_parts(pem, pem)
    }

    pub fn from_pem_parts(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(cert_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        Self::new(cert, key)
    }

    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let pem = std::fs::read(path.as_ref())?;
        Self::from_pem(&pem)
    }

    /// Generate a self-signed P-256 client certificate valid for a year
    pub fn self_signed(common_name: &str) -> Result<Self, TlsError> {
        let now = SystemTime::now();
        let day = Duration::from_secs(24 * 60 * 60);
        Self::self_signed_with_validity(common_name, now - day, now + 365 * day)
    }

    /// Generate a self-signed P-256 client certificate for a fixed window
    pub fn self_signed_with_validity(
        common_name: &str,
        not_before: SystemTime,
        not_after: SystemTime,
    ) -> Result<Self, TlsError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        let not_before = asn1_time(not_before)?;
        let not_after = asn1_time(not_after)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Self::new(builder.build(), key)
    }

    pub fn x509(&self) -> &X509Ref {
        &self.cert
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn fingerprint(&self) -> CertFingerprint {
        self.identity.fingerprint
    }

    pub fn info(&self) -> &CertInfo {
        &self.identity.info
    }

    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }

    /// Whether the validity window contains the current time
    pub fn is_valid_now(&self) -> bool {
        match Asn1Time::days_from_now(0) {
            Ok(now) => self.is_valid_at(&now),
            Err(_) => false,
        }
    }

    fn is_valid_at(&self, now: &Asn1TimeRef) -> bool {
        let started = matches!(
            self.cert.not_before().compare(now),
            Ok(Ordering::Less | Ordering::Equal)
        );
        let not_expired = matches!(
            self.cert.not_after().compare(now),
            Ok(Ordering::Greater | Ordering::Equal)
        );
        started && not_expired
    }

    /// PEM encoding of the certificate followed by the PKCS#8 key
    pub fn to_pem(&self) -> Result<Vec<u8>, TlsError> {
        let mut pem = self.cert.to_pem()?;
        let key = self.key.private_key_to_pem_pkcs8()?;
        pem.extend_from_slice(&key);
        Ok(pem)
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("subject", &self.identity.info.subject)
            .field("fingerprint", &self.identity.fingerprint)
            .finish()
    }
}

fn asn1_time(time: SystemTime) -> Result<Asn1Time, TlsError> {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TlsError::Certificate("validity before the Unix epoch".to_string()))?
        .as_secs();
    let secs = libc::time_t::try_from(secs)
        .map_err(|_| TlsError::Certificate("validity out of range".to_string()))?;
    Ok(Asn1Time::from_unix(secs)?)
}

/// Extract certificate chain information from SSL connection
pub fn get_cert_chain(ssl: &openssl::ssl::SslRef) -> Vec<CertInfo> {
    let mut chain = Vec::new();

    // Client side: the peer chain already starts with the leaf
    if let Some(cert_chain) = ssl.peer_cert_chain() {
        for cert in cert_chain {
            chain.push(CertInfo::from_x509(cert));
        }
    } else if let Some(peer_cert) = ssl.peer_certificate() {
        chain.push(CertInfo::from_x509(&peer_cert));
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::builtin_cert::BUILTIN_CERT;

    #[test]
    fn test_cert_info_from_builtin() {
        let cert = X509::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
        let info = CertInfo::from_x509(&cert);

        assert_eq!(info.subject, "example.com");
        assert_eq!(info.issuer, "example.com"); // Self-signed

        assert_eq!(info.subject_alt_names.len(), 2);
        assert!(info.subject_alt_names.contains(&"DNS:example.com".to_string()));
        assert!(info.subject_alt_names.contains(&"DNS:*.example.com".to_string()));
    }

    #[test]
    fn test_builtin_bundle_is_client_certificate() {
        let cert = ClientCertificate::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
        assert_eq!(cert.info().subject, "example.com");
        assert!(cert.is_valid_now());
    }

    #[test]
    fn test_fingerprint_hex() {
        let cert = X509::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
        let fingerprint = CertFingerprint::of(&cert).unwrap();
        let hex = fingerprint.to_string();

        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fingerprint, CertFingerprint::of(&cert).unwrap());
    }

    #[test]
    fn test_self_signed() {
        let a = ClientCertificate::self_signed("client-a").unwrap();
        let b = ClientCertificate::self_signed("client-a").unwrap();

        assert_eq!(a.info().subject, "client-a");
        assert_eq!(a.info().issuer, "client-a");
        assert!(a.is_valid_now());
        // Fresh keys, so distinct identities
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_pem_round_trip_keeps_identity() {
        let cert = ClientCertificate::self_signed("client").unwrap();
        let reloaded = ClientCertificate::from_pem(&cert.to_pem().unwrap()).unwrap();
        assert_eq!(reloaded.identity(), cert.identity());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let a = ClientCertificate::self_signed("a").unwrap();
        let b = ClientCertificate::self_signed("b").unwrap();

        let result = ClientCertificate::new(a.x509().to_owned(), b.key.clone());
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }

    #[test]
    fn test_validity_window() {
        let day = Duration::from_secs(24 * 60 * 60);
        let now = SystemTime::now();

        let expired =
            ClientCertificate::self_signed_with_validity("old", now - 10 * day, now - day).unwrap();
        assert!(!expired.is_valid_now());

        let future =
            ClientCertificate::self_signed_with_validity("new", now + day, now + 10 * day).unwrap();
        assert!(!future.is_valid_now());
    }

    #[test]
    fn test_garbage_pem() {
        assert!(matches!(
            ClientCertificate::from_pem(b"garbage"),
            Err(TlsError::Certificate(_))
        ));
    }
}
