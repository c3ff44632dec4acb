//! TLS support for pooled HTTPS connections
//!
//! This module implements the TLS side of client-certificate authentication:
//! which certificate to offer, how the handshake binds it to a connection,
//! and the sessions that come out of it.
//!
//! # Architecture
//!
//! 1. `CertificateStore` holds candidate certificates for each
//!    `CertificatePolicy`
//! 2. `HandshakeNegotiator` selects one candidate, binds it to a fresh `Ssl`
//!    object and performs the handshake
//! 3. `TlsSession` implements the `SessionOps` trait for encrypted I/O and
//!    remembers the identity it was negotiated with
//!
//! The server side (`TlsConfig::server()`, `ServerTlsSession`) exists so
//! loopback servers can observe which certificate a client presented.
//!
//! # Examples
//!
//! ```no_run
//! use certpool::http::tls::{CertificatePolicy, ClientCertificate, HandshakeNegotiator, TlsConfig};
//! use certpool::net::Endpoint;
//! use std::sync::Arc;
//!
//! let negotiator = HandshakeNegotiator::new(TlsConfig::client().build().unwrap());
//! let cert = Arc::new(ClientCertificate::self_signed("client").unwrap());
//!
//! let session = negotiator
//!     .negotiate(
//!         &Endpoint::https("example.com", 443),
//!         CertificatePolicy::Manual,
//!         &[cert],
//!         None,
//!     )
//!     .unwrap();
//! println!("negotiated {}", session.vars().version);
//! ```

pub mod backend;
pub mod builtin_cert;
pub mod cert;
pub mod config;
pub mod handshake;
pub mod policy;
pub mod session;
pub mod store;
pub mod vars;

pub use backend::BackendCapabilities;
pub use cert::{CertFingerprint, CertIdentity, CertInfo, ClientCertificate, PeerCertificate};
pub use config::{
    ClientConfigBuilder, ClientVerify, ServerConfigBuilder, TlsClientConfig, TlsConfig, TlsError,
    TlsServerConfig, TlsVersion,
};
pub use handshake::{
    CancelToken, HandshakeError, HandshakeNegotiator, NegotiatorStats, PolicyErrors,
    ServerCertificateValidator, VerifyIssue,
};
pub use policy::CertificatePolicy;
pub use session::{ServerTlsSession, SessionId, TlsSession};
pub use store::{
    CertificateStore, NoPlatformCertificates, PemDirectorySource, PlatformCertificateSource,
};
pub use vars::TlsVars;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
