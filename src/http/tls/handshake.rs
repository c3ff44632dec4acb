//! TLS handshake negotiation
//!
//! `HandshakeNegotiator` turns an endpoint, a certificate policy and a list
//! of candidate certificates into an established `TlsSession`. The chosen
//! certificate is bound to the per-connection `Ssl` object, never to the
//! shared context, so concurrent handshakes for different identities do not
//! interfere.
//!
//! Server certificate validation runs inside OpenSSL's verify callback. Every
//! chain error is recorded; at the leaf the caller's validator sees the peer
//! certificate, the chain and the accumulated errors and decides.

use super::backend::{self, BackendCapabilities};
use super::cert::{CertInfo, ClientCertificate, PeerCertificate};
use super::config::{TlsClientConfig, TlsError};
use super::policy::CertificatePolicy;
use super::session::TlsSession;
use crate::http::dispatch::ErrorKind;
use crate::http::pool::ValidationScope;
use crate::net::{self, Endpoint};
use openssl::ssl::{self, Ssl, SslStream, SslVerifyMode};
use openssl::x509::X509StoreContextRef;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Decides whether the server's certificate is acceptable
pub type ServerCertificateValidator =
    Arc<dyn Fn(&PeerCertificate, &[CertInfo], &PolicyErrors) -> bool + Send + Sync>;

/// `X509_V_ERR_HOSTNAME_MISMATCH`
const HOSTNAME_MISMATCH: i32 = 62;
/// `X509_V_ERR_IP_ADDRESS_MISMATCH`
const IP_ADDRESS_MISMATCH: i32 = 64;

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("TLS backend cannot defer client certificate selection")]
    BackendUnsupported,

    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: net::Error,
    },

    #[error("handshake with {0} timed out")]
    Timeout(Endpoint),

    #[error("server certificate for {0} rejected")]
    ServerCertificateRejected(Endpoint),

    #[error("handshake cancelled")]
    Cancelled,

    #[error("TLS setup failed: {0}")]
    Setup(#[from] TlsError),

    #[error("handshake with {endpoint} failed: {reason}")]
    Failed { endpoint: Endpoint, reason: String },
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::BackendUnsupported => ErrorKind::BackendUnsupported,
            HandshakeError::Connect { .. } => ErrorKind::Connect,
            HandshakeError::Timeout(_) => ErrorKind::HandshakeTimeout,
            HandshakeError::ServerCertificateRejected(_) => ErrorKind::ServerCertificateRejected,
            HandshakeError::Cancelled => ErrorKind::Cancelled,
            HandshakeError::Setup(e) => e.kind(),
            HandshakeError::Failed { .. } => ErrorKind::HandshakeFailed,
        }
    }
}

impl From<openssl::error::ErrorStack> for HandshakeError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        HandshakeError::Setup(TlsError::OpenSsl(e))
    }
}

/// One problem OpenSSL's verifier found in the server chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    /// Chain position, 0 being the leaf
    pub depth: u32,
    /// Raw `X509_V_ERR_*` code
    pub code: i32,
    pub reason: String,
}

/// Everything wrong with the server certificate, as seen by the verifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyErrors {
    issues: Vec<VerifyIssue>,
}

impl PolicyErrors {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues(&self) -> &[VerifyIssue] {
        &self.issues
    }

    /// The certificate does not cover the host or IP address dialled
    pub fn name_mismatch(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.code == HOSTNAME_MISMATCH || i.code == IP_ADDRESS_MISMATCH)
    }

    /// Chain building or trust problems, excluding name mismatches
    pub fn chain_errors(&self) -> impl Iterator<Item = &VerifyIssue> {
        self.issues
            .iter()
            .filter(|i| i.code != HOSTNAME_MISMATCH && i.code != IP_ADDRESS_MISMATCH)
    }
}

/// Per-handshake verification progress
struct VerifyState {
    validator: Option<ServerCertificateValidator>,
    progress: Mutex<VerifyProgress>,
    rejected: AtomicBool,
}

#[derive(Default)]
struct VerifyProgress {
    errors: PolicyErrors,
    // Verdict and the error count it was reached with
    verdict: Option<(usize, bool)>,
}

impl VerifyState {
    fn new(validator: Option<ServerCertificateValidator>) -> Self {
        VerifyState {
            validator,
            progress: Mutex::new(VerifyProgress::default()),
            rejected: AtomicBool::new(false),
        }
    }

    fn verify(&self, preverify_ok: bool, ctx: &mut X509StoreContextRef) -> bool {
        let depth = ctx.error_depth();
        let errors = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            if !preverify_ok {
                let error = ctx.error();
                progress.errors.issues.push(VerifyIssue {
                    depth,
                    code: error.as_raw(),
                    reason: error.error_string().to_string(),
                });
            }
            // Decide at the leaf only
            if depth > 0 {
                return true;
            }
            let seen = progress.errors.issues.len();
            if let Some((at, verdict)) = progress.verdict {
                if at == seen {
                    return verdict;
                }
            }
            progress.errors.clone()
        };

        let verdict = match &self.validator {
            Some(validator) => match ctx.current_cert().map(PeerCertificate::from_x509) {
                Some(Ok(peer)) => {
                    let chain: Vec<CertInfo> = ctx
                        .chain()
                        .map(|chain| chain.iter().map(CertInfo::from_x509).collect())
                        .unwrap_or_default();
                    validator(&peer, &chain, &errors)
                }
                _ => false,
            },
            None => errors.is_empty(),
        };

        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.verdict = Some((errors.issues.len(), verdict));
        if !verdict {
            self.rejected.store(true, Ordering::Release);
        }
        verdict
    }

    fn rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
}

/// Aborts an in-progress handshake from another thread
///
/// Cancelling shuts the registered socket down, which makes the blocked
/// handshake fail; the negotiator then reports `Cancelled`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                socket: Mutex::new(None),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let socket = self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = socket.as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn register(&self, stream: &TcpStream) -> io::Result<Registration<'_>> {
        let clone = stream.try_clone()?;
        let mut socket = self.inner.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            let _ = clone.shutdown(Shutdown::Both);
        }
        *socket = Some(clone);
        Ok(Registration { token: self })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Clears the token's socket once the handshake is over
struct Registration<'a> {
    token: &'a CancelToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.token
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Handshake counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatorStats {
    pub attempted: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Performs TLS handshakes for one client configuration
pub struct HandshakeNegotiator {
    config: TlsClientConfig,
    attempted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl HandshakeNegotiator {
    pub fn new(config: TlsClientConfig) -> Self {
        HandshakeNegotiator {
            config,
            attempted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TlsClientConfig {
        &self.config
    }

    /// Injected capabilities, or the process-wide detected ones
    pub fn capabilities(&self) -> BackendCapabilities {
        self.config.capabilities().unwrap_or_else(backend::capabilities)
    }

    /// Fail early when the backend cannot honour the policy
    ///
    /// Manual with no candidates needs nothing from the backend and passes.
    pub fn check_capabilities(
        &self,
        policy: CertificatePolicy,
        candidates: &[Arc<ClientCertificate>],
    ) -> Result<(), HandshakeError> {
        if self.capabilities().supports_deferred_selection() {
            return Ok(());
        }
        match policy {
            CertificatePolicy::Manual if candidates.is_empty() => Ok(()),
            _ => Err(HandshakeError::BackendUnsupported),
        }
    }

    /// First candidate whose validity window contains the current time
    pub fn select_certificate(
        &self,
        candidates: &[Arc<ClientCertificate>],
    ) -> Option<Arc<ClientCertificate>> {
        for cert in candidates {
            if cert.is_valid_now() {
                return Some(Arc::clone(cert));
            }
            tracing::debug!(
                fingerprint = %cert.fingerprint(),
                subject = %cert.info().subject,
                "skipping client certificate outside its validity window"
            );
        }
        None
    }

    /// Perform one handshake
    pub fn negotiate(
        &self,
        endpoint: &Endpoint,
        policy: CertificatePolicy,
        candidates: &[Arc<ClientCertificate>],
        validator: Option<&ServerCertificateValidator>,
    ) -> Result<TlsSession, HandshakeError> {
        self.check_capabilities(policy, candidates)?;
        let selected = self.select_certificate(candidates);
        self.handshake(endpoint, policy, selected.as_deref(), validator, None)
    }

    /// Perform one handshake that `cancel` can abort
    pub fn negotiate_cancellable(
        &self,
        endpoint: &Endpoint,
        policy: CertificatePolicy,
        candidates: &[Arc<ClientCertificate>],
        validator: Option<&ServerCertificateValidator>,
        cancel: &CancelToken,
    ) -> Result<TlsSession, HandshakeError> {
        self.check_capabilities(policy, candidates)?;
        let selected = self.select_certificate(candidates);
        self.handshake(endpoint, policy, selected.as_deref(), validator, Some(cancel))
    }

    /// Handshake with a certificate the caller already selected
    ///
    /// The caller is responsible for `check_capabilities`.
    pub(crate) fn handshake(
        &self,
        endpoint: &Endpoint,
        policy: CertificatePolicy,
        selected: Option<&ClientCertificate>,
        validator: Option<&ServerCertificateValidator>,
        cancel: Option<&CancelToken>,
    ) -> Result<TlsSession, HandshakeError> {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        let result = self.try_handshake(endpoint, policy, selected, validator, cancel);
        match &result {
            Ok(session) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    %endpoint,
                    session = %session.id(),
                    %policy,
                    client_certificate = ?session.client_certificate().map(|c| c.fingerprint),
                    version = %session.vars().version,
                    "TLS handshake completed"
                );
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%endpoint, %policy, %error, "TLS handshake failed");
            }
        }
        result
    }

    fn try_handshake(
        &self,
        endpoint: &Endpoint,
        policy: CertificatePolicy,
        selected: Option<&ClientCertificate>,
        validator: Option<&ServerCertificateValidator>,
        cancel: Option<&CancelToken>,
    ) -> Result<TlsSession, HandshakeError> {
        let is_cancelled = || cancel.is_some_and(|c| c.is_cancelled());
        if is_cancelled() {
            return Err(HandshakeError::Cancelled);
        }

        let tcp = net::connect(endpoint, self.config.connect_timeout()).map_err(|source| {
            HandshakeError::Connect {
                endpoint: endpoint.clone(),
                source,
            }
        })?;
        let _registration = match cancel {
            Some(token) => Some(token.register(&tcp).map_err(TlsError::from)?),
            None => None,
        };

        let timeout = Some(self.config.handshake_timeout());
        tcp.set_read_timeout(timeout).map_err(TlsError::from)?;
        tcp.set_write_timeout(timeout).map_err(TlsError::from)?;

        let mut ssl = Ssl::new(&self.config.ctx)?;
        if let Some(cert) = selected {
            ssl.set_certificate(cert.x509())?;
            ssl.set_private_key(cert.private_key())?;
        }
        match endpoint.ip() {
            Some(ip) => ssl.param_mut().set_ip(ip)?,
            None => {
                let servername = self.config.servername().unwrap_or(endpoint.host());
                ssl.set_hostname(servername)?;
                ssl.param_mut().set_host(endpoint.host())?;
            }
        }

        let state = Arc::new(VerifyState::new(validator.cloned()));
        let callback_state = Arc::clone(&state);
        ssl.set_verify_callback(SslVerifyMode::PEER, move |ok, ctx| {
            callback_state.verify(ok, ctx)
        });

        let stream = match ssl.connect(tcp) {
            Ok(stream) => stream,
            Err(e) => return Err(self.classify_failure(e, endpoint, &state, is_cancelled())),
        };

        if let Err(e) = clear_timeouts(&stream) {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            return Err(TlsError::from(e).into());
        }
        if is_cancelled() {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            return Err(HandshakeError::Cancelled);
        }

        Ok(TlsSession::established(
            stream,
            endpoint.clone(),
            policy,
            selected.map(|c| c.identity().clone()),
            self.config.constraints(),
            ValidationScope::new(validator, &self.config),
        ))
    }

    fn classify_failure(
        &self,
        error: ssl::HandshakeError<TcpStream>,
        endpoint: &Endpoint,
        state: &VerifyState,
        cancelled: bool,
    ) -> HandshakeError {
        let (mid, would_block) = match error {
            ssl::HandshakeError::SetupFailure(stack) => return stack.into(),
            ssl::HandshakeError::Failure(mid) => (mid, false),
            ssl::HandshakeError::WouldBlock(mid) => (mid, true),
        };

        // Never hand back a half-open connection
        let _ = mid.get_ref().shutdown(Shutdown::Both);

        let timed_out = would_block
            || mid.error().io_error().is_some_and(|e| {
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
            });

        if cancelled {
            HandshakeError::Cancelled
        } else if state.rejected() {
            HandshakeError::ServerCertificateRejected(endpoint.clone())
        } else if timed_out {
            HandshakeError::Timeout(endpoint.clone())
        } else {
            HandshakeError::Failed {
                endpoint: endpoint.clone(),
                reason: mid.error().to_string(),
            }
        }
    }

    pub fn stats(&self) -> NegotiatorStats {
        NegotiatorStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

fn clear_timeouts(stream: &SslStream<TcpStream>) -> io::Result<()> {
    stream.get_ref().set_read_timeout(None)?;
    stream.get_ref().set_write_timeout(None)
}

impl std::fmt::Debug for HandshakeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeNegotiator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
