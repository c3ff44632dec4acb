//! TLS configuration
//!
//! Builders for the client context shared by every handshake a
//! `HandshakeNegotiator` performs, and for the server side used by loopback
//! servers.

use super::backend::BackendCapabilities;
use super::session::ServerTlsSession;
use crate::http::pool::ProtocolConstraints;
use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// Client certificate verification mode (server-side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerify {
    /// Don't request client certificates
    None,
    /// Request client certificate but don't require it
    Optional,
    /// Require client certificate
    Required,
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid certificate policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

impl TlsError {
    pub fn kind(&self) -> crate::http::dispatch::ErrorKind {
        use crate::http::dispatch::ErrorKind;
        match self {
            TlsError::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
            TlsError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Entry point for the configuration builders
pub struct TlsConfig;

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Client-side TLS configuration (immutable after building)
///
/// The OpenSSL context carries settings common to every connection. The
/// client certificate is never set here: it belongs to the per-connection
/// `Ssl` object created for each handshake.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub(crate) ctx: SslContext,
    servername: Option<String>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
    ca_file: Option<PathBuf>,
    default_verify_paths: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    capabilities: Option<BackendCapabilities>,
}

impl TlsClientConfig {
    /// SNI override; the endpoint host is used when unset
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// Extra trust roots
    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    /// Whether the system trust roots are loaded
    pub fn default_verify_paths(&self) -> bool {
        self.default_verify_paths
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Capabilities injected at build time, if any
    pub fn capabilities(&self) -> Option<BackendCapabilities> {
        self.capabilities
    }

    /// Protocol settings that make two sessions interchangeable
    pub fn constraints(&self) -> ProtocolConstraints {
        ProtocolConstraints {
            min_version: self.min_version,
            max_version: self.max_version,
            alpn: self.alpn.clone(),
        }
    }
}

impl std::fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientConfig")
            .field("servername", &self.servername)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("alpn", &self.alpn)
            .field("ca_file", &self.ca_file)
            .field("default_verify_paths", &self.default_verify_paths)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Client configuration builder
#[derive(Debug)]
pub struct ClientConfigBuilder {
    servername: Option<String>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    alpn: Vec<String>,
    ca_file: Option<PathBuf>,
    default_verify_paths: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    capabilities: Option<BackendCapabilities>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        ClientConfigBuilder {
            servername: None,
            min_version: None,
            max_version: None,
            cipher_list: None,
            ciphersuites: None,
            alpn: Vec::new(),
            ca_file: None,
            default_verify_paths: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            capabilities: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphersuites = Some(ciphers.into());
        self
    }

    /// Set ALPN protocols, in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Trust the CA certificates in a PEM file, in addition to the system roots
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Whether to load the system's default trust roots (on by default)
    pub fn default_verify_paths(mut self, enabled: bool) -> Self {
        self.default_verify_paths = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the detected backend capabilities
    pub fn capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsClientConfig, TlsError> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(TlsError::InvalidConfig(format!(
                    "minimum version {} above maximum {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
        }

        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx.set_min_proto_version(self.min_version.map(|v| v.to_openssl_version()))?;
        ctx.set_max_proto_version(self.max_version.map(|v| v.to_openssl_version()))?;
        if let Some(ciphers) = &self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(ciphers) = &self.ciphersuites {
            ctx.set_ciphersuites(ciphers)?;
        }
        if !self.alpn.is_empty() {
            let protos = encode_alpn(&self.alpn)?;
            ctx.set_alpn_protos(&protos)?;
        }
        if self.default_verify_paths {
            ctx.set_default_verify_paths()?;
        }
        if let Some(path) = &self.ca_file {
            ctx.set_ca_file(path)?;
        }
        // Per-connection verify callbacks replace this mode
        ctx.set_verify(SslVerifyMode::PEER);

        Ok(TlsClientConfig {
            ctx: ctx.build(),
            servername: self.servername,
            min_version: self.min_version,
            max_version: self.max_version,
            alpn: self.alpn,
            ca_file: self.ca_file,
            default_verify_paths: self.default_verify_paths,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            capabilities: self.capabilities,
        })
    }
}

/// Length-prefixed ALPN wire encoding
fn encode_alpn(protocols: &[String]) -> Result<Vec<u8>, TlsError> {
    let mut alpn_bytes = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| TlsError::InvalidConfig(format!("bad ALPN protocol {:?}", proto)))?;
        alpn_bytes.push(len);
        alpn_bytes.extend_from_slice(proto.as_bytes());
    }
    Ok(alpn_bytes)
}

/// Server-side TLS configuration
#[derive(Clone)]
pub struct TlsServerConfig {
    ctx: SslContext,
}

impl TlsServerConfig {
    /// Accept a client connection with TLS (perform handshake)
    pub fn accept(&self, stream: TcpStream) -> Result<ServerTlsSession, TlsError> {
        ServerTlsSession::accept(&self.ctx, stream)
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    cert_pem: Option<Vec<u8>>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<String>,
    client_verify: ClientVerify,
    client_verify_ca: Option<PathBuf>,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        ServerConfigBuilder {
            cert_pem: None,
            min_version: None,
            max_version: None,
            alpn: Vec::new(),
            client_verify: ClientVerify::None,
            client_verify_ca: None,
        }
    }
}

impl ServerConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set ALPN protocols the server is willing to select
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Load server certificate and key from a PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Self {
        self.cert_pem = Some(pem.to_vec());
        self
    }

    /// Load server certificate and key from a PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        let pem = fs::read(path.as_ref())?;
        Ok(self.cert_pem(&pem))
    }

    /// Set client certificate verification mode
    ///
    /// Without `client_verify_ca` every presented client certificate is
    /// accepted, which lets a test server observe any identity.
    pub fn client_verify(mut self, mode: ClientVerify) -> Self {
        self.client_verify = mode;
        self
    }

    /// Set CA file for client certificate verification
    pub fn client_verify_ca<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.client_verify_ca = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsServerConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        ctx.set_min_proto_version(self.min_version.map(|v| v.to_openssl_version()))?;
        ctx.set_max_proto_version(self.max_version.map(|v| v.to_openssl_version()))?;

        // If no certificate was loaded, use the built-in certificate
        let pem = self
            .cert_pem
            .as_deref()
            .unwrap_or(super::builtin_cert::BUILTIN_CERT.as_bytes());
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        ctx.set_certificate(&cert)?;
        ctx.set_private_key(&key)?;
        ctx.check_private_key()?;

        if !self.alpn.is_empty() {
            let protocols: Vec<Vec<u8>> = self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
            ctx.set_alpn_select_callback(move |_ssl, client_protos| {
                select_alpn(&protocols, client_protos).ok_or(openssl::ssl::AlpnError::NOACK)
            });
        }

        let mode = match self.client_verify {
            ClientVerify::None => SslVerifyMode::NONE,
            ClientVerify::Optional => SslVerifyMode::PEER,
            ClientVerify::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        };
        match &self.client_verify_ca {
            Some(path) => {
                ctx.set_ca_file(path)?;
                ctx.set_verify(mode);
            }
            None => ctx.set_verify_callback(mode, |_, _| true),
        }

        Ok(TlsServerConfig { ctx: ctx.build() })
    }
}

/// First client protocol (in client order) that the server also offers
fn select_alpn<'a>(ours: &[Vec<u8>], client_protos: &'a [u8]) -> Option<&'a [u8]> {
    let mut pos = 0;
    while pos < client_protos.len() {
        let len = client_protos[pos] as usize;
        pos += 1;
        let proto = client_protos.get(pos..pos + len)?;
        if ours.iter().any(|p| p.as_slice() == proto) {
            return Some(proto);
        }
        pos += len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .alpn(&["http/1.1"])
            .handshake_timeout(Duration::from_secs(3))
            .build()
            .unwrap();

        assert_eq!(config.servername(), Some("example.com"));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);

        let constraints = config.constraints();
        assert_eq!(constraints.min_version, Some(TlsVersion::Tls13));
        assert_eq!(constraints.max_version, Some(TlsVersion::Tls13));
        assert_eq!(constraints.alpn, vec!["http/1.1".to_string()]);
    }

    #[test]
    fn test_inverted_version_range_rejected() {
        let result = TlsConfig::client()
            .version_range(TlsVersion::Tls13, TlsVersion::Tls12)
            .build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_alpn_rejected() {
        let result = TlsConfig::client().alpn(&[""]).build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_server_config_builder() {
        // Server with built-in cert
        TlsConfig::server()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .client_verify(ClientVerify::Optional)
            .build()
            .unwrap();
    }

    #[test]
    fn test_server_rejects_garbage_cert() {
        let result = TlsConfig::server().cert_pem(b"not a pem").build();
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }

    #[test]
    fn test_select_alpn() {
        let ours = vec![b"http/1.1".to_vec()];
        assert_eq!(select_alpn(&ours, b"\x02h2\x08http/1.1"), Some(&b"http/1.1"[..]));
        assert_eq!(select_alpn(&ours, b"\x02h2"), None);
        assert_eq!(select_alpn(&ours, b"\x09http/1.1"), None);
    }
}
