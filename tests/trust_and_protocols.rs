//! CA-based trust, required client certificates and ALPN against the loopback server

mod common;

use certpool::http::dispatch::ErrorKind;
use certpool::http::tls::{
    CertificatePolicy, ClientCertificate, ClientVerify, HandshakeNegotiator,
    ServerCertificateValidator, TlsConfig, TlsVersion,
};
use certpool::HttpsClient;
use common::{accept_any, client_cert, LoopbackServer, ServerOptions, TestCa, Usage};
use std::sync::Arc;

#[test]
fn test_ca_trusted_server_without_validator() {
    let ca = TestCa::new("certpool trust CA");
    let server = LoopbackServer::with_options(ServerOptions {
        cert_file: Some(ca.issue_file("server", Usage::Server)),
        ..ServerOptions::default()
    });
    let tls = TlsConfig::client()
        .ca_file(ca.ca_file())
        .default_verify_paths(false)
        .build()
        .unwrap();
    let client = HttpsClient::builder().tls_config(tls).build().unwrap();
    assert!(client.validator().is_none());

    let response = client.get(&server.url("/trusted")).unwrap();
    assert_eq!(response.status().code(), 200);
    assert!(client.get(&server.url("/again")).unwrap().connection().reused);

    // The built-in server identity is not signed by that CA
    let untrusted = LoopbackServer::start();
    let err = client.get(&untrusted.url("/")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerCertificateRejected);
}

#[test]
fn test_required_client_certificate() {
    let server = LoopbackServer::with_options(ServerOptions {
        client_verify: ClientVerify::Required,
        version: Some(TlsVersion::Tls12),
        ..ServerOptions::default()
    });

    let anonymous = HttpsClient::builder()
        .server_certificate_validator(accept_any())
        .build()
        .unwrap();
    let err = anonymous.get(&server.url("/")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
    assert_eq!(anonymous.pool().stats().keys, 0);

    let cert = client_cert("required");
    let client = HttpsClient::builder()
        .certificate(Arc::clone(&cert))
        .server_certificate_validator(accept_any())
        .build()
        .unwrap();
    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(response.status().code(), 200);
    assert_eq!(response.connection().tls_version, "TLSv1.2");
    assert_eq!(server.observed(), vec![Some(cert.fingerprint())]);
}

#[test]
fn test_client_certificate_must_chain_to_server_ca() {
    let ca = TestCa::new("certpool client CA");
    let server = LoopbackServer::with_options(ServerOptions {
        client_verify: ClientVerify::Required,
        client_verify_ca: Some(ca.ca_file()),
        version: Some(TlsVersion::Tls12),
        ..ServerOptions::default()
    });

    let issued = Arc::new(ClientCertificate::from_pem(&ca.issue("alice", Usage::Client)).unwrap());
    let client = HttpsClient::builder()
        .certificate(Arc::clone(&issued))
        .server_certificate_validator(accept_any())
        .build()
        .unwrap();
    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(
        response.headers().get("X-Client-Cert"),
        Some(issued.fingerprint().to_string().as_str())
    );

    let stranger = HttpsClient::builder()
        .certificate(client_cert("stranger"))
        .server_certificate_validator(accept_any())
        .build()
        .unwrap();
    let err = stranger.get(&server.url("/")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
    assert_eq!(server.observed(), vec![Some(issued.fingerprint())]);
}

#[test]
fn test_server_selects_alpn_in_client_order() {
    let server = LoopbackServer::with_options(ServerOptions {
        alpn: vec!["http/1.1"],
        ..ServerOptions::default()
    });
    let negotiator = HandshakeNegotiator::new(
        TlsConfig::client().alpn(&["h2", "http/1.1"]).build().unwrap(),
    );
    let validator: ServerCertificateValidator = Arc::new(accept_any());

    let session = negotiator
        .negotiate(&server.endpoint(), CertificatePolicy::Manual, &[], Some(&validator))
        .unwrap();
    assert_eq!(session.vars().alpn.as_deref(), Some("http/1.1"));
    assert_eq!(session.constraints().alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
    session.close().unwrap();

    // No overlap: the server declines ALPN and the handshake still completes
    let negotiator = HandshakeNegotiator::new(TlsConfig::client().alpn(&["h2"]).build().unwrap());
    let session = negotiator
        .negotiate(&server.endpoint(), CertificatePolicy::Manual, &[], Some(&validator))
        .unwrap();
    assert_eq!(session.vars().alpn, None);
}
