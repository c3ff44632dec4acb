//! TLS backend capability detection

use std::sync::OnceLock;

/// What the linked TLS library can do for client authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    deferred_selection: bool,
}

impl BackendCapabilities {
    pub fn supported() -> Self {
        BackendCapabilities {
            deferred_selection: true,
        }
    }

    pub fn unsupported() -> Self {
        BackendCapabilities {
            deferred_selection: false,
        }
    }

    /// Whether a client certificate can be bound to a connection and offered
    /// only when the server asks for one
    pub fn supports_deferred_selection(&self) -> bool {
        self.deferred_selection
    }
}

/// Inspect the linked library
///
/// OpenSSL proper offers a bound certificate only in answer to a
/// CertificateRequest. LibreSSL and BoringSSL builds are treated as lacking
/// that guarantee.
pub fn detect_openssl() -> BackendCapabilities {
    let version = openssl::version::version();
    let supported = version.starts_with("OpenSSL");
    tracing::debug!(version, supported, "detected TLS backend");
    if supported {
        BackendCapabilities::supported()
    } else {
        BackendCapabilities::unsupported()
    }
}

/// Process-wide capabilities, detected on first use
pub fn capabilities() -> BackendCapabilities {
    static CAPABILITIES: OnceLock<BackendCapabilities> = OnceLock::new();
    *CAPABILITIES.get_or_init(detect_openssl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_cached() {
        assert_eq!(capabilities(), capabilities());
        assert_eq!(capabilities(), detect_openssl());
    }

    #[test]
    fn test_constructors() {
        assert!(BackendCapabilities::supported().supports_deferred_selection());
        assert!(!BackendCapabilities::unsupported().supports_deferred_selection());
    }
}
