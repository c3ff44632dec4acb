//! HTTP/1.1 over pooled TLS sessions
//!
//! This module layers a small HTTP/1.1 exchange on top of TLS sessions whose
//! client-certificate identity is part of their pooling key.
//!
//! # Architecture
//!
//! The HTTP layer keeps the session operations abstraction, so message I/O
//! never needs to know which TLS session it runs over:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `tls::TlsSession` implements it for client sessions, `tls::ServerTlsSession`
//!   for accepted ones
//! - `HttpClient` / `HttpServer` run one request/response exchange over any
//!   `SessionOps` and hand the session back afterwards
//!
//! On top of that sit the parts that decide *which* session a request uses:
//!
//! - `pool::ConnectionPool` caches idle sessions per `PoolKey`
//! - `dispatch::RequestDispatcher` acquires or negotiates a session and runs
//!   the exchange
//! - `https::HttpsClient` owns the certificate policy and store
//!
//! # Examples
//!
//! ```no_run
//! use certpool::{CertificatePolicy, ClientCertificate, HttpsClient};
//!
//! let cert = ClientCertificate::from_pem_file("client.pem").unwrap();
//! let client = HttpsClient::builder()
//!     .policy(CertificatePolicy::Manual)
//!     .certificate(cert)
//!     .server_certificate_validator(|_peer, _chain, _errors| true)
//!     .build()
//!     .unwrap();
//!
//! let response = client.get("https://127.0.0.1:8443/").unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod client;
pub mod dispatch;
pub mod headers;
pub mod https;
pub mod message;
pub mod parser;
pub mod pool;
pub mod server;
pub mod session;
pub mod tls;

pub use client::HttpClient;
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::{BodyFraming, RequestParser, ResponseParser};
pub use server::HttpServer;
pub use session::{HttpSession, PollEvents, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Message too large")]
    TooLarge,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session already closed")]
    SessionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// Maximum size of a message head (start line plus headers)
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
