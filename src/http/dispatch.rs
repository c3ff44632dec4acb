//! Request dispatch over pooled TLS sessions
//!
//! For each request the dispatcher works out which client certificate the
//! handshake would bind, builds the `PoolKey` from it before any I/O, and
//! then either reuses an idle session for that key or negotiates a new one.
//! After the exchange the session goes back to the pool when the response
//! allows reuse and is closed otherwise.
//!
//! ```text
//! Idle ──► Negotiating ──► Established ──► InUse ──► ReturnedIdle
//!   │            │              ▲   │         │
//!   └── pooled ──┼──────────────┘   │         └────► Closed
//!                └──────────────────┴──────────────► Closed
//! ```

use super::https::HttpsClient;
use super::pool::{ConnectionPool, PoolError, PoolKey, Released, ValidationScope};
use super::tls::{CancelToken, CertIdentity, HandshakeError, HandshakeNegotiator, SessionId, TlsError, TlsSession};
use super::{Error as HttpError, HttpClient, HttpRequest, HttpResponse, Method, Status};
use crate::net::{Endpoint, Scheme};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default time allowed for each read or write of an exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error taxonomy shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidPolicy,
    BackendUnsupported,
    HandshakeTimeout,
    ServerCertificateRejected,
    TransportFault,
    PoolExhausted,
    Cancelled,
    Connect,
    HandshakeFailed,
    InvalidRequest,
    InvalidState,
    Configuration,
}

/// Lifecycle of the connection serving one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Established,
    InUse,
    ReturnedIdle,
    Closed,
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal step
    pub fn can_advance(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Idle, Established)
                | (Negotiating, Established)
                | (Negotiating, Closed)
                | (Established, InUse)
                | (Established, Closed)
                | (InUse, ReturnedIdle)
                | (InUse, Closed)
        )
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.can_advance(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::ReturnedIdle | ConnectionState::Closed)
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("transport fault on session {session}: {source}")]
    TransportFault {
        session: SessionId,
        #[source]
        source: HttpError,
    },

    #[error("unsupported scheme for {0}, only https is served")]
    UnsupportedScheme(Endpoint),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Handshake(e) => e.kind(),
            DispatchError::Pool(e) => e.kind(),
            DispatchError::Tls(e) => e.kind(),
            DispatchError::TransportFault { .. } => ErrorKind::TransportFault,
            DispatchError::UnsupportedScheme(_) | DispatchError::InvalidRequest(_) => {
                ErrorKind::InvalidRequest
            }
            DispatchError::State(_) => ErrorKind::InvalidState,
        }
    }
}

/// An HTTP request addressed to an endpoint
#[derive(Debug, Clone)]
pub struct Request {
    endpoint: Endpoint,
    http: HttpRequest,
}

impl Request {
    /// Request for an absolute URL, with `Host` filled in
    pub fn new(method: Method, url: &str) -> Result<Self, DispatchError> {
        let (endpoint, target) =
            Endpoint::parse_url(url).map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        let http = HttpRequest::builder().method(method).target(target).build();
        Ok(Self::from_parts(endpoint, http))
    }

    pub fn get(url: &str) -> Result<Self, DispatchError> {
        Self::new(Method::Get, url)
    }

    pub fn from_parts(endpoint: Endpoint, mut http: HttpRequest) -> Self {
        if !http.headers().contains("Host") {
            http.headers_mut().set("Host", endpoint.authority());
        }
        Request { endpoint, http }
    }

    /// Set a header, replacing earlier values
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.headers_mut().set(name, value);
        self
    }

    pub fn body(self, body: Vec<u8>) -> Self {
        let Request { endpoint, http } = self;
        let http = HttpRequest::builder()
            .method(http.method())
            .target(http.target())
            .version(http.version())
            .headers(http.headers().clone())
            .body(body)
            .build();
        Request { endpoint, http }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn method(&self) -> Method {
        self.http.method()
    }

    pub fn http(&self) -> &HttpRequest {
        &self.http
    }
}

/// How a response was obtained
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session: SessionId,
    /// The session came from the pool rather than a new handshake
    pub reused: bool,
    /// An idempotent request was repeated after a stale pooled session failed
    pub retried: bool,
    /// Certificate bound to the session's handshake
    pub client_certificate: Option<CertIdentity>,
    pub tls_version: String,
    /// `ReturnedIdle` or `Closed`
    pub state: ConnectionState,
}

/// Response together with the connection details that produced it
#[derive(Debug, Clone)]
pub struct Response {
    http: HttpResponse,
    connection: ConnectionInfo,
}

impl Response {
    pub fn status(&self) -> Status {
        self.http.status()
    }

    pub fn headers(&self) -> &super::Headers {
        self.http.headers()
    }

    pub fn body(&self) -> &[u8] {
        self.http.body()
    }

    pub fn text(&self) -> String {
        self.http.text()
    }

    pub fn http(&self) -> &HttpResponse {
        &self.http
    }

    pub fn into_http(self) -> HttpResponse {
        self.http
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }
}

/// Failed exchange, with the session it ran over
struct ExchangeFailure {
    error: HttpError,
    session: TlsSession,
    bytes_received: usize,
}

/// Obtains sessions for requests and runs the exchanges
pub struct RequestDispatcher {
    negotiator: HandshakeNegotiator,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    retry_stale: bool,
    // Sessions this dispatcher left idle in the pool
    returned: Mutex<HashMap<PoolKey, HashSet<SessionId>>>,
}

impl RequestDispatcher {
    pub fn new(negotiator: HandshakeNegotiator, pool: Arc<ConnectionPool>) -> Self {
        RequestDispatcher {
            negotiator,
            pool,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_stale: true,
            returned: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Repeat idempotent requests once when a pooled session turns out dead
    pub fn with_retry_stale(mut self, enabled: bool) -> Self {
        self.retry_stale = enabled;
        self
    }

    pub fn negotiator(&self) -> &HandshakeNegotiator {
        &self.negotiator
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Key the next request to `endpoint` would use under the client's policy
    pub fn pool_key(&self, endpoint: &Endpoint, client: &HttpsClient) -> Result<PoolKey, DispatchError> {
        let (key, _) = self.resolve(endpoint, client)?;
        Ok(key)
    }

    pub fn send(&self, request: &Request, client: &HttpsClient) -> Result<Response, DispatchError> {
        self.dispatch(request, client, None)
    }

    pub fn send_cancellable(
        &self,
        request: &Request,
        client: &HttpsClient,
        cancel: &CancelToken,
    ) -> Result<Response, DispatchError> {
        self.dispatch(request, client, Some(cancel))
    }

    /// Close the idle sessions this dispatcher returned to the pool
    ///
    /// Sessions other users of a shared pool left idle stay untouched.
    pub fn close(&self) -> usize {
        let returned = std::mem::take(&mut *self.returned());
        returned
            .iter()
            .map(|(key, ids)| self.pool.evict_sessions(key, ids))
            .sum()
    }

    fn returned(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, HashSet<SessionId>>> {
        self.returned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a session released to the pool, forgetting ids no longer idle
    fn remember(&self, key: &PoolKey, id: SessionId) {
        let idle: HashSet<SessionId> = self.pool.idle_ids(key).into_iter().collect();
        let mut returned = self.returned();
        let ids = returned.entry(key.clone()).or_default();
        ids.retain(|id| idle.contains(id));
        ids.insert(id);
    }

    fn forget(&self, key: &PoolKey, id: SessionId) {
        let mut returned = self.returned();
        if let Some(ids) = returned.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                returned.remove(key);
            }
        }
    }

    /// Capability gate, certificate selection and key, all before any I/O
    fn resolve(
        &self,
        endpoint: &Endpoint,
        client: &HttpsClient,
    ) -> Result<(PoolKey, Option<Arc<super::tls::ClientCertificate>>), DispatchError> {
        let policy = client.policy();
        let candidates = client.store().candidates(policy);
        self.negotiator.check_capabilities(policy, &candidates)?;
        let selected = self.negotiator.select_certificate(&candidates);
        let key = PoolKey::new(
            endpoint.clone(),
            policy,
            selected.as_ref().map(|c| c.fingerprint()),
            self.negotiator.config().constraints(),
            ValidationScope::new(client.validator(), self.negotiator.config()),
        );
        Ok((key, selected))
    }

    fn dispatch(
        &self,
        request: &Request,
        client: &HttpsClient,
        cancel: Option<&CancelToken>,
    ) -> Result<Response, DispatchError> {
        if request.endpoint().scheme() != Scheme::Https {
            return Err(DispatchError::UnsupportedScheme(request.endpoint().clone()));
        }

        let (key, selected) = self.resolve(request.endpoint(), client)?;

        let mut retried = false;
        loop {
            let mut state = ConnectionState::Idle;
            let pooled = if retried { None } else { self.pool.acquire(&key) };
            let reused = pooled.is_some();

            let session = match pooled {
                Some(session) => {
                    self.forget(&key, session.id());
                    state.advance(ConnectionState::Established)?;
                    session
                }
                None => {
                    let reservation = self.pool.reserve(&key)?;
                    state.advance(ConnectionState::Negotiating)?;
                    let session = self.negotiator.handshake(
                        request.endpoint(),
                        key.policy(),
                        selected.as_deref(),
                        client.validator(),
                        cancel,
                    )?;
                    reservation.complete(&session);
                    state.advance(ConnectionState::Established)?;
                    session
                }
            };

            if cancel.is_some_and(|c| c.is_cancelled()) {
                state.advance(ConnectionState::Closed)?;
                self.pool.discard(&key, session);
                return Err(HandshakeError::Cancelled.into());
            }

            state.advance(ConnectionState::InUse)?;
            let session_id = session.id();
            match self.exchange(session, request.http()) {
                Ok((http, session, reusable)) => {
                    let info = ConnectionInfo {
                        session: session_id,
                        reused,
                        retried,
                        client_certificate: session.client_certificate().cloned(),
                        tls_version: session.vars().version.clone(),
                        state: ConnectionState::Closed,
                    };
                    let returned = if reusable {
                        let pooled = self.pool.release(&key, session) == Released::Pooled;
                        if pooled {
                            self.remember(&key, session_id);
                        }
                        pooled
                    } else {
                        self.pool.discard(&key, session);
                        false
                    };
                    state.advance(if returned {
                        ConnectionState::ReturnedIdle
                    } else {
                        ConnectionState::Closed
                    })?;
                    return Ok(Response {
                        http,
                        connection: ConnectionInfo { state, ..info },
                    });
                }
                Err(failure) => {
                    state.advance(ConnectionState::Closed)?;
                    self.pool.discard(&key, failure.session);

                    let stale = reused
                        && failure.bytes_received == 0
                        && matches!(failure.error, HttpError::ConnectionClosed | HttpError::Io(_));
                    if stale && self.retry_stale && request.method().is_idempotent() {
                        tracing::debug!(%key, session = %session_id, error = %failure.error, "stale pooled session, retrying on a new one");
                        retried = true;
                        continue;
                    }

                    tracing::warn!(%key, session = %session_id, error = %failure.error, "request failed");
                    return Err(DispatchError::TransportFault {
                        session: session_id,
                        source: failure.error,
                    });
                }
            }
        }
    }

    fn exchange(
        &self,
        session: TlsSession,
        request: &HttpRequest,
    ) -> Result<(HttpResponse, TlsSession, bool), ExchangeFailure> {
        let mut client = HttpClient::new(session);
        client.set_timeout(self.request_timeout);
        match client.exchange(request) {
            Ok(response) => {
                let reusable = client.is_reusable();
                Ok((response, client.into_inner(), reusable))
            }
            Err(error) => {
                let bytes_received = client.bytes_received();
                Err(ExchangeFailure {
                    error,
                    session: client.into_inner(),
                    bytes_received,
                })
            }
        }
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("negotiator", &self.negotiator)
            .field("pool", &self.pool)
            .field("request_timeout", &self.request_timeout)
            .field("retry_stale", &self.retry_stale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let mut fresh = ConnectionState::Idle;
        for next in [
            ConnectionState::Negotiating,
            ConnectionState::Established,
            ConnectionState::InUse,
            ConnectionState::ReturnedIdle,
        ] {
            fresh.advance(next).unwrap();
        }
        assert!(fresh.is_terminal());

        let mut pooled = ConnectionState::Idle;
        pooled.advance(ConnectionState::Established).unwrap();
        pooled.advance(ConnectionState::InUse).unwrap();
        pooled.advance(ConnectionState::Closed).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = ConnectionState::Idle;
        let err = state.advance(ConnectionState::InUse).unwrap_err();
        assert_eq!(err.from, ConnectionState::Idle);
        assert_eq!(state, ConnectionState::Idle);

        let mut done = ConnectionState::ReturnedIdle;
        assert!(done.advance(ConnectionState::InUse).is_err());
        assert!(!ConnectionState::Negotiating.can_advance(ConnectionState::InUse));
        assert!(!ConnectionState::Closed.can_advance(ConnectionState::Idle));

        let err: DispatchError = err.into();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_request_from_url() {
        let request = Request::get("https://Example.com:8443/a?b=c").unwrap();
        assert_eq!(request.endpoint().host(), "example.com");
        assert_eq!(request.endpoint().port(), 8443);
        assert_eq!(request.http().target(), "/a?b=c");
        assert_eq!(request.http().headers().get("Host"), Some("example.com:8443"));

        let request = Request::new(Method::Post, "https://example.com/")
            .unwrap()
            .header("X-Test", "1")
            .body(b"payload".to_vec());
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.http().body(), b"payload");
        assert_eq!(request.http().headers().get("x-test"), Some("1"));
        assert_eq!(request.http().headers().get("Host"), Some("example.com"));
    }

    #[test]
    fn test_bad_url() {
        let err = Request::get("ftp://example.com/").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
