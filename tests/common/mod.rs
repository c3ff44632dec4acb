//! Loopback HTTPS server for integration tests
//!
//! Answers every request with `200 hello` and records, per TLS connection,
//! the fingerprint of the client certificate it received.

#![allow(dead_code)]

use certpool::http::tls::{
    CertFingerprint, ClientCertificate, ClientVerify, TlsConfig, TlsServerConfig, TlsVersion,
};
use certpool::http::{HttpResponse, HttpServer, Status};
use certpool::net::Endpoint;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509NameBuilder, X509};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Validator accepting any server certificate
pub fn accept_any(
) -> impl Fn(&certpool::http::tls::PeerCertificate, &[certpool::http::tls::CertInfo], &certpool::http::tls::PolicyErrors) -> bool
       + Send
       + Sync
       + 'static {
    |_, _, _| true
}

pub fn client_cert(name: &str) -> Arc<ClientCertificate> {
    Arc::new(ClientCertificate::self_signed(name).unwrap())
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub client_verify: ClientVerify,
    /// CA that client certificates must chain to
    pub client_verify_ca: Option<PathBuf>,
    /// Answer with `Connection: close` and hang up after each response
    pub connection_close: bool,
    /// Hang up connections idle for this long
    pub idle_close: Option<Duration>,
    pub version: Option<TlsVersion>,
    pub alpn: Vec<&'static str>,
    /// Server identity PEM file, the built-in one otherwise
    pub cert_file: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            client_verify: ClientVerify::Optional,
            client_verify_ca: None,
            connection_close: false,
            idle_close: None,
            version: None,
            alpn: Vec::new(),
            cert_file: None,
        }
    }
}

impl ServerOptions {
    fn config(&self) -> TlsServerConfig {
        let mut builder = TlsConfig::server()
            .client_verify(self.client_verify)
            .alpn(&self.alpn);
        if let Some(version) = self.version {
            builder = builder.version(version);
        }
        if let Some(path) = &self.client_verify_ca {
            builder = builder.client_verify_ca(path);
        }
        if let Some(path) = &self.cert_file {
            builder = builder.cert_file(path).unwrap();
        }
        builder.build().unwrap()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Usage {
    Server,
    Client,
}

/// Throwaway certificate authority writing its PEM files to a temp dir
pub struct TestCa {
    cert: X509,
    key: PKey<Private>,
    dir: tempfile::TempDir,
    serial: AtomicUsize,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = ec_key();
        let name = x509_name(common_name);
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let not_before = Asn1Time::days_from_now(0).unwrap();
        let not_after = Asn1Time::days_from_now(30).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
            .unwrap();
        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(ski).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        let ca = TestCa {
            cert: builder.build(),
            key,
            dir: tempfile::tempdir().unwrap(),
            serial: AtomicUsize::new(2),
        };
        std::fs::write(ca.ca_file(), ca.cert.to_pem().unwrap()).unwrap();
        ca
    }

    pub fn ca_file(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    /// Certificate and key PEM bundle for 127.0.0.1 signed by this CA
    pub fn issue(&self, common_name: &str, usage: Usage) -> Vec<u8> {
        let key = ec_key();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) as u32;
        let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&x509_name(common_name)).unwrap();
        builder.set_issuer_name(self.cert.subject_name()).unwrap();
        builder.set_pubkey(&key).unwrap();
        let not_before = Asn1Time::days_from_now(0).unwrap();
        let not_after = Asn1Time::days_from_now(7).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
        builder
            .append_extension(KeyUsage::new().critical().digital_signature().build().unwrap())
            .unwrap();
        let eku = match usage {
            Usage::Server => ExtendedKeyUsage::new().server_auth().build(),
            Usage::Client => ExtendedKeyUsage::new().client_auth().build(),
        };
        builder.append_extension(eku.unwrap()).unwrap();
        let san = SubjectAlternativeName::new()
            .ip("127.0.0.1")
            .build(&builder.x509v3_context(Some(&*self.cert), None))
            .unwrap();
        builder.append_extension(san).unwrap();
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&*self.cert), None))
            .unwrap();
        builder.append_extension(aki).unwrap();
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();

        let mut pem = builder.build().to_pem().unwrap();
        pem.extend_from_slice(&key.private_key_to_pem_pkcs8().unwrap());
        pem
    }

    /// Issue a server identity and write it next to the CA file
    pub fn issue_file(&self, common_name: &str, usage: Usage) -> PathBuf {
        let path = self.dir.path().join(format!("{common_name}.pem"));
        std::fs::write(&path, self.issue(common_name, usage)).unwrap();
        path
    }
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn x509_name(common_name: &str) -> X509Name {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    name.build()
}

#[derive(Default)]
struct State {
    connections: AtomicUsize,
    requests: AtomicUsize,
    observed: Mutex<Vec<Option<CertFingerprint>>>,
}

pub struct LoopbackServer {
    port: u16,
    state: Arc<State>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl LoopbackServer {
    pub fn start() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = options.config();

        let state = Arc::new(State::default());
        let stop = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let config = config.clone();
                    let state = Arc::clone(&state);
                    let options = options.clone();
                    thread::spawn(move || serve(config, stream, state, options));
                }
            })
        };

        LoopbackServer {
            port,
            state,
            stop,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.port, path)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::https("127.0.0.1", self.port)
    }

    /// TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Client certificate seen on each completed TLS handshake
    pub fn observed(&self) -> Vec<Option<CertFingerprint>> {
        self.state.observed.lock().unwrap().clone()
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn serve(config: TlsServerConfig, stream: TcpStream, state: Arc<State>, options: ServerOptions) {
    let Ok(session) = config.accept(stream) else {
        return;
    };
    let fingerprint = session.client_certificate().map(|c| c.fingerprint());
    state.observed.lock().unwrap().push(fingerprint);

    let mut server = HttpServer::new(session);
    server.set_timeout(Some(options.idle_close.unwrap_or(Duration::from_secs(30))));

    while let Ok(Some(request)) = server.receive_request() {
        state.requests.fetch_add(1, Ordering::SeqCst);

        let mut response = HttpResponse::builder()
            .status(Status::OK)
            .header(
                "X-Client-Cert",
                fingerprint.map_or_else(|| "none".to_string(), |f| f.to_string()),
            )
            .header("X-Path", request.target());
        if options.connection_close {
            response = response.header("Connection", "close");
        }

        let sent = server.send_response(&response.body(b"hello".to_vec()).build());
        if sent.is_err() || options.connection_close {
            break;
        }
    }
    let _ = server.close();
}

/// Listener that completes TCP connects but never speaks TLS
pub struct SilentServer {
    listener: TcpListener,
}

impl SilentServer {
    pub fn start() -> Self {
        init_tracing();
        SilentServer {
            listener: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.listener.local_addr().unwrap().port(), path)
    }
}
