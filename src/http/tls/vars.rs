//! Negotiated TLS parameters
//!
//! A snapshot of what the handshake agreed on, taken once the handshake
//! completes and kept with the session for diagnostics and `ConnectionInfo`.

use super::cert::{get_cert_chain, CertInfo};
use openssl::ssl::{NameType, SslRef};

/// TLS variables available after handshake
#[derive(Debug, Clone, Default)]
pub struct TlsVars {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI servername sent by the client
    pub servername: Option<String>,

    /// Negotiated ALPN protocol
    pub alpn: Option<String>,

    /// Certificate chain (index 0 is peer cert)
    pub cert_chain: Vec<CertInfo>,

    /// Whether session was resumed
    pub sess_reused: bool,
}

impl TlsVars {
    /// Create TLS variables from a completed handshake
    pub fn from_ssl(ssl: &SslRef) -> Self {
        TlsVars {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
            cert_chain: get_cert_chain(ssl),
            sess_reused: ssl.session_reused(),
        }
    }

    /// Get certificate info by index (0 = peer cert, 1+ = chain)
    pub fn cert(&self, index: usize) -> Option<&CertInfo> {
        self.cert_chain.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::builtin_cert::BUILTIN_CERT;
    use openssl::x509::X509;

    #[test]
    fn test_cert_lookup() {
        let cert = X509::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
        let vars = TlsVars {
            cert_chain: vec![CertInfo::from_x509(&cert)],
            ..TlsVars::default()
        };

        assert_eq!(vars.cert(0).map(|c| c.subject.as_str()), Some("example.com"));
        assert!(vars.cert(1).is_none());
    }
}
