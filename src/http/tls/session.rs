//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections. Client
//! sessions come out of `HandshakeNegotiator` carrying the identity they were
//! negotiated for; server sessions come out of `TlsServerConfig::accept`.

use super::cert::{CertIdentity, PeerCertificate};
use super::config::TlsError;
use super::policy::CertificatePolicy;
use super::vars::TlsVars;
use crate::http::pool::{ProtocolConstraints, ValidationScope};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use crate::net::Endpoint;
use openssl::ssl::{ErrorCode, Ssl, SslContextRef, SslStream};
use std::fmt;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Encrypted stream shared by client and server sessions
struct TlsIo {
    stream: SslStream<TcpStream>,
    failed: bool,
    closed: bool,
}

impl TlsIo {
    fn new(stream: SslStream<TcpStream>) -> Self {
        TlsIo {
            stream,
            failed: false,
            closed: false,
        }
    }

    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        // Decrypted bytes already buffered inside OpenSSL
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        match self.stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                self.failed = true;
                Ok(0)
            }
            Err(e) => {
                self.failed = true;
                // An unexpected EOF surfaces as SYSCALL without an I/O error
                if e.code() == ErrorCode::SYSCALL && e.io_error().is_none() {
                    return Ok(0);
                }
                Err(Error::Io(e.into_io_error().unwrap_or_else(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e)
                })))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn flush(&mut self) -> HttpResult<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Perform SSL shutdown if not failed
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }
}

impl Drop for TlsIo {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Client session produced by a completed handshake
///
/// The session remembers the endpoint, policy, protocol constraints, client
/// certificate identity and server validation it was negotiated with, which
/// is everything the pool needs to decide whether it may serve another
/// request.
pub struct TlsSession {
    id: SessionId,
    endpoint: Endpoint,
    policy: CertificatePolicy,
    client_certificate: Option<CertIdentity>,
    constraints: ProtocolConstraints,
    validation: ValidationScope,
    peer: Option<PeerCertificate>,
    vars: TlsVars,
    established_at: Instant,
    io: TlsIo,
}

impl TlsSession {
    pub(crate) fn established(
        stream: SslStream<TcpStream>,
        endpoint: Endpoint,
        policy: CertificatePolicy,
        client_certificate: Option<CertIdentity>,
        constraints: ProtocolConstraints,
        validation: ValidationScope,
    ) -> Self {
        let vars = TlsVars::from_ssl(stream.ssl());
        let peer = stream
            .ssl()
            .peer_certificate()
            .and_then(|cert| PeerCertificate::from_x509(&cert).ok());
        TlsSession {
            id: SessionId::next(),
            endpoint,
            policy,
            client_certificate,
            constraints,
            validation,
            peer,
            vars,
            established_at: Instant::now(),
            io: TlsIo::new(stream),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn policy(&self) -> CertificatePolicy {
        self.policy
    }

    /// Identity of the certificate bound to the handshake, if any
    ///
    /// OpenSSL transmits it only when the server requested a certificate.
    pub fn client_certificate(&self) -> Option<&CertIdentity> {
        self.client_certificate.as_ref()
    }

    pub fn constraints(&self) -> &ProtocolConstraints {
        &self.constraints
    }

    /// How the server certificate was accepted
    pub fn validation(&self) -> &ValidationScope {
        &self.validation
    }

    /// Leaf certificate the server presented
    pub fn peer_certificate(&self) -> Option<&PeerCertificate> {
        self.peer.as_ref()
    }

    /// Get TLS variables
    pub fn vars(&self) -> &TlsVars {
        &self.vars
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Check if TLS I/O failed or the peer closed the connection
    pub fn failed(&self) -> bool {
        self.io.failed
    }

    pub fn is_closed(&self) -> bool {
        self.io.closed
    }

    /// Whether the session may carry another exchange
    pub fn is_open(&self) -> bool {
        !self.io.failed && !self.io.closed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.io.stream.get_ref()
    }

    /// Shut the session down and release its socket
    pub fn close(mut self) -> HttpResult<()> {
        self.io.close()
    }
}

impl SessionOps for TlsSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        self.io.poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.io.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.io.write(buf)
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.io.flush()
    }

    fn close(&mut self) -> HttpResult<()> {
        self.io.close()
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .field(
                "client_certificate",
                &self.client_certificate.as_ref().map(|c| c.fingerprint),
            )
            .field("version", &self.vars.version)
            .field("failed", &self.io.failed)
            .field("closed", &self.io.closed)
            .finish()
    }
}

/// Server side of an accepted TLS connection
pub struct ServerTlsSession {
    client_certificate: Option<PeerCertificate>,
    vars: TlsVars,
    io: TlsIo,
}

impl ServerTlsSession {
    /// Accept a client connection with TLS (perform handshake)
    pub(crate) fn accept(ctx: &SslContextRef, tcp_stream: TcpStream) -> Result<Self, TlsError> {
        let ssl = Ssl::new(ctx)?;

        let stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        let client_certificate = match stream.ssl().peer_certificate() {
            Some(cert) => Some(PeerCertificate::from_x509(&cert)?),
            None => None,
        };

        Ok(ServerTlsSession {
            client_certificate,
            vars: TlsVars::from_ssl(stream.ssl()),
            io: TlsIo::new(stream),
        })
    }

    /// Certificate the client presented during the handshake
    pub fn client_certificate(&self) -> Option<&PeerCertificate> {
        self.client_certificate.as_ref()
    }

    pub fn vars(&self) -> &TlsVars {
        &self.vars
    }

    pub fn failed(&self) -> bool {
        self.io.failed
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.io.stream.get_ref()
    }
}

impl SessionOps for ServerTlsSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        self.io.poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.io.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.io.write(buf)
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.io.flush()
    }

    fn close(&mut self) -> HttpResult<()> {
        self.io.close()
    }
}
