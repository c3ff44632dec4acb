//! certpool - HTTPS client with client-certificate aware connection pooling
//!
//! This crate provides an HTTP/1.1 client over OpenSSL that presents TLS
//! client certificates and pools handshake-completed sessions per
//! certificate identity, so a session negotiated with one certificate is
//! never handed to a request that implies another.

pub mod http;
pub mod net;

pub use http::dispatch::{DispatchError, ErrorKind, Request, RequestDispatcher, Response};
pub use http::https::{HttpsClient, HttpsClientBuilder};
pub use http::pool::{ConnectionPool, PoolConfig, PoolKey};
pub use http::tls::{CertificatePolicy, CertificateStore, ClientCertificate, HandshakeNegotiator};
pub use net::{Endpoint, Scheme};
