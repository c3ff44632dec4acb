//! Candidate client certificates
//!
//! `CertificateStore` answers one question for the negotiator: which
//! certificates may be offered under a given policy. Manual candidates are
//! the ones the caller added, in insertion order. Automatic candidates come
//! from a `PlatformCertificateSource`.

use super::cert::{CertFingerprint, ClientCertificate};
use super::config::TlsError;
use super::policy::CertificatePolicy;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Platform certificate discovery used by the Automatic policy
pub trait PlatformCertificateSource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ClientCertificate>, TlsError>;
}

/// Source that never finds anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlatformCertificates;

impl PlatformCertificateSource for NoPlatformCertificates {
    fn enumerate(&self) -> Result<Vec<ClientCertificate>, TlsError> {
        Ok(Vec::new())
    }
}

/// Every `*.pem` bundle in a directory holding both a certificate and a key
///
/// Files are visited in name order. Files that fail to load are skipped.
#[derive(Debug, Clone)]
pub struct PemDirectorySource {
    dir: PathBuf,
}

impl PemDirectorySource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        PemDirectorySource {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl PlatformCertificateSource for PemDirectorySource {
    fn enumerate(&self) -> Result<Vec<ClientCertificate>, TlsError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "pem"))
            .collect();
        paths.sort();

        let mut certs = Vec::new();
        for path in paths {
            match ClientCertificate::from_pem_file(&path) {
                Ok(cert) => certs.push(cert),
                Err(error) => {
                    tracing::debug!(path = %path.display(), %error, "skipping PEM file");
                }
            }
        }
        Ok(certs)
    }
}

/// Client certificates available to one client
pub struct CertificateStore {
    manual: RwLock<Vec<Arc<ClientCertificate>>>,
    platform: Arc<dyn PlatformCertificateSource>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::with_platform_source(Arc::new(NoPlatformCertificates))
    }

    pub fn with_platform_source(platform: Arc<dyn PlatformCertificateSource>) -> Self {
        CertificateStore {
            manual: RwLock::new(Vec::new()),
            platform,
        }
    }

    /// Append a manual certificate
    pub fn add(&self, cert: impl Into<Arc<ClientCertificate>>) {
        let cert = cert.into();
        tracing::debug!(fingerprint = %cert.fingerprint(), subject = %cert.info().subject, "client certificate added");
        self.manual
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cert);
    }

    /// Remove every manual certificate with this fingerprint
    pub fn remove(&self, fingerprint: &CertFingerprint) -> bool {
        let mut manual = self.manual.write().unwrap_or_else(PoisonError::into_inner);
        let before = manual.len();
        manual.retain(|cert| cert.fingerprint() != *fingerprint);
        manual.len() != before
    }

    /// Manual certificates in insertion order
    pub fn manual(&self) -> Vec<Arc<ClientCertificate>> {
        self.manual
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.manual.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Certificates that may be offered under `policy`
    ///
    /// A failing platform enumeration degrades to no candidates.
    pub fn candidates(&self, policy: CertificatePolicy) -> Vec<Arc<ClientCertificate>> {
        match policy {
            CertificatePolicy::Manual => self.manual(),
            CertificatePolicy::Automatic => match self.platform.enumerate() {
                Ok(certs) => certs.into_iter().map(Arc::new).collect(),
                Err(error) => {
                    tracing::warn!(%error, "platform certificate enumeration failed");
                    Vec::new()
                }
            },
        }
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("manual", &self.manual())
            .finish_non_exhaustive()
    }
}
