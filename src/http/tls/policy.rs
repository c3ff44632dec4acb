//! Client certificate selection policy

use super::config::TlsError;
use std::fmt;
use std::str::FromStr;

/// How the client picks the certificate it offers during a handshake
///
/// `Manual` offers certificates the caller added to the client, `Automatic`
/// offers certificates discovered from the platform source. Values outside
/// this domain cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CertificatePolicy {
    #[default]
    Manual = 0,
    Automatic = 1,
}

impl CertificatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificatePolicy::Manual => "manual",
            CertificatePolicy::Automatic => "automatic",
        }
    }
}

impl TryFrom<i32> for CertificatePolicy {
    type Error = TlsError;

    fn try_from(raw: i32) -> Result<Self, TlsError> {
        match raw {
            0 => Ok(CertificatePolicy::Manual),
            1 => Ok(CertificatePolicy::Automatic),
            _ => Err(TlsError::InvalidPolicy(raw.to_string())),
        }
    }
}

impl From<CertificatePolicy> for i32 {
    fn from(policy: CertificatePolicy) -> i32 {
        policy as i32
    }
}

impl FromStr for CertificatePolicy {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, TlsError> {
        if s.eq_ignore_ascii_case("manual") {
            Ok(CertificatePolicy::Manual)
        } else if s.eq_ignore_ascii_case("automatic") {
            Ok(CertificatePolicy::Automatic)
        } else {
            Err(TlsError::InvalidPolicy(s.to_string()))
        }
    }
}

impl fmt::Display for CertificatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
