//! Connection pool keyed by certificate identity
//!
//! A pooled session already completed a full handshake with a particular
//! client certificate, so it may only serve requests that would have chosen
//! the same certificate. `PoolKey` captures that: endpoint, policy, the
//! fingerprint of the bound certificate and the protocol constraints. It also
//! carries the `ValidationScope`, since a session accepted by one validator
//! must not serve a client that would have rejected the server.
//!
//! The pool mutex guards bookkeeping only. Handshakes happen outside it,
//! and sessions are closed after the lock is released.

use crate::http::dispatch::ErrorKind;
use crate::http::tls::{
    CertFingerprint, CertificatePolicy, ServerCertificateValidator, SessionId, TlsClientConfig,
    TlsSession, TlsVersion,
};
use crate::net::Endpoint;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Protocol settings two sessions must share to be interchangeable
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProtocolConstraints {
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub alpn: Vec<String>,
}

/// How the server certificate of a session was judged
///
/// Validators compare by instance: two clients share sessions only when they
/// hold the same `ServerCertificateValidator` (or both have none) and trust
/// the same roots under the same SNI name.
#[derive(Clone)]
pub struct ValidationScope {
    validator: Option<ServerCertificateValidator>,
    ca_file: Option<PathBuf>,
    default_verify_paths: bool,
    servername: Option<String>,
}

impl ValidationScope {
    pub fn new(validator: Option<&ServerCertificateValidator>, config: &TlsClientConfig) -> Self {
        ValidationScope {
            validator: validator.cloned(),
            ca_file: config.ca_file().map(|p| p.to_path_buf()),
            default_verify_paths: config.default_verify_paths(),
            servername: config.servername().map(str::to_string),
        }
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    fn validator_addr(&self) -> Option<*const ()> {
        self.validator.as_ref().map(|v| Arc::as_ptr(v) as *const ())
    }
}

impl Default for ValidationScope {
    /// No validator and the system trust roots, as `TlsConfig::client()` builds
    fn default() -> Self {
        ValidationScope {
            validator: None,
            ca_file: None,
            default_verify_paths: true,
            servername: None,
        }
    }
}

impl PartialEq for ValidationScope {
    fn eq(&self, other: &Self) -> bool {
        self.validator_addr() == other.validator_addr()
            && self.ca_file == other.ca_file
            && self.default_verify_paths == other.default_verify_paths
            && self.servername == other.servername
    }
}

impl Eq for ValidationScope {}

impl Hash for ValidationScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.validator_addr().map(|p| p as usize).hash(state);
        self.ca_file.hash(state);
        self.default_verify_paths.hash(state);
        self.servername.hash(state);
    }
}

impl fmt::Debug for ValidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationScope")
            .field("validator", &self.validator_addr())
            .field("ca_file", &self.ca_file)
            .field("default_verify_paths", &self.default_verify_paths)
            .field("servername", &self.servername)
            .finish()
    }
}

/// Equivalence class of sessions that may serve the same request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    endpoint: Endpoint,
    policy: CertificatePolicy,
    client_certificate: Option<CertFingerprint>,
    constraints: ProtocolConstraints,
    validation: ValidationScope,
}

impl PoolKey {
    pub fn new(
        endpoint: Endpoint,
        policy: CertificatePolicy,
        client_certificate: Option<CertFingerprint>,
        constraints: ProtocolConstraints,
        validation: ValidationScope,
    ) -> Self {
        PoolKey {
            endpoint,
            policy,
            client_certificate,
            constraints,
            validation,
        }
    }

    /// Key a session was negotiated under
    pub fn for_session(session: &TlsSession) -> Self {
        PoolKey {
            endpoint: session.endpoint().clone(),
            policy: session.policy(),
            client_certificate: session.client_certificate().map(|c| c.fingerprint),
            constraints: session.constraints().clone(),
            validation: session.validation().clone(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn policy(&self) -> CertificatePolicy {
        self.policy
    }

    pub fn client_certificate(&self) -> Option<CertFingerprint> {
        self.client_certificate
    }

    pub fn constraints(&self) -> &ProtocolConstraints {
        &self.constraints
    }

    pub fn validation(&self) -> &ValidationScope {
        &self.validation
    }

    /// Whether `session` was negotiated under exactly this key
    pub fn admits(&self, session: &TlsSession) -> bool {
        self.endpoint == *session.endpoint()
            && self.policy == session.policy()
            && self.client_certificate == session.client_certificate().map(|c| c.fingerprint)
            && self.constraints == *session.constraints()
            && self.validation == *session.validation()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.endpoint, self.policy)?;
        match &self.client_certificate {
            Some(fingerprint) => write!(f, ", cert {}]", fingerprint),
            None => write!(f, ", no cert]"),
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle sessions kept per key; 0 disables pooling
    pub max_idle_per_key: usize,
    /// Idle, busy and pending sessions allowed per key
    pub max_connections_per_key: Option<usize>,
    /// Idle sessions older than this are closed instead of reused
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle_per_key: 4,
            max_connections_per_key: None,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolConfig {
    /// Every session is closed after one exchange
    pub fn disabled() -> Self {
        PoolConfig {
            max_idle_per_key: 0,
            ..PoolConfig::default()
        }
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection limit of {limit} reached for {key}")]
    Exhausted { key: PoolKey, limit: usize },
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } => ErrorKind::PoolExhausted,
        }
    }
}

/// Why a released session was closed instead of pooled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// I/O failed or the peer closed the connection
    Unhealthy,
    /// The session was negotiated under a different key
    KeyMismatch,
    /// The session is not checked out from this pool
    NotCheckedOut,
    /// `max_idle_per_key` is 0
    PoolingDisabled,
    /// The key already holds `max_idle_per_key` idle sessions
    IdleLimit,
}

/// Outcome of `ConnectionPool::release`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Pooled,
    Discarded(DiscardReason),
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub pending: usize,
    pub keys: usize,
}

struct IdleSession {
    session: TlsSession,
    since: Instant,
}

#[derive(Default)]
struct PoolEntry {
    // Most recently idled last
    idle: Vec<IdleSession>,
    busy: HashSet<SessionId>,
    pending: usize,
}

impl PoolEntry {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }

    fn is_unused(&self) -> bool {
        self.total() == 0
    }
}

/// Keyed cache of handshake-completed TLS sessions
pub struct ConnectionPool {
    config: PoolConfig,
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        ConnectionPool {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, PoolEntry>> {
        // Bookkeeping never panics half-way, so a poisoned map is consistent
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out the most recently idled session for `key`
    ///
    /// Expired sessions met on the way are closed.
    pub fn acquire(&self, key: &PoolKey) -> Option<TlsSession> {
        let mut expired = Vec::new();
        let acquired = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                tracing::debug!(%key, "pool miss");
                return None;
            };
            let mut acquired = None;
            while let Some(idle) = entry.idle.pop() {
                if idle.since.elapsed() >= self.config.idle_timeout || !idle.session.is_open() {
                    expired.push(idle.session);
                    continue;
                }
                entry.busy.insert(idle.session.id());
                acquired = Some(idle.session);
                break;
            }
            if entry.is_unused() {
                entries.remove(key);
            }
            acquired
        };

        close_sessions(expired, key, "expired idle session closed");
        match &acquired {
            Some(session) => tracing::debug!(%key, session = %session.id(), "pool hit"),
            None => tracing::debug!(%key, "pool miss"),
        }
        acquired
    }

    /// Account for a negotiation about to start for `key`
    pub fn reserve(&self, key: &PoolKey) -> Result<Reservation<'_>, PoolError> {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        if let Some(limit) = self.config.max_connections_per_key {
            if entry.total() >= limit {
                if entry.is_unused() {
                    entries.remove(key);
                }
                tracing::warn!(%key, limit, "connection limit reached");
                return Err(PoolError::Exhausted {
                    key: key.clone(),
                    limit,
                });
            }
        }
        entry.pending += 1;
        Ok(Reservation {
            pool: self,
            key: key.clone(),
            active: true,
        })
    }

    /// Return a checked-out session after a clean exchange
    pub fn release(&self, key: &PoolKey, session: TlsSession) -> Released {
        let outcome = {
            let mut entries = self.lock();
            if !key.admits(&session) {
                // Stop tracking it under the key it really belongs to
                let own_key = PoolKey::for_session(&session);
                remove_busy(&mut entries, &own_key, session.id());
                Err((session, DiscardReason::KeyMismatch))
            } else if !remove_busy(&mut entries, key, session.id()) {
                Err((session, DiscardReason::NotCheckedOut))
            } else if !session.is_open() {
                Err((session, DiscardReason::Unhealthy))
            } else if self.config.max_idle_per_key == 0 {
                Err((session, DiscardReason::PoolingDisabled))
            } else {
                let entry = entries.entry(key.clone()).or_default();
                if entry.idle.len() >= self.config.max_idle_per_key {
                    Err((session, DiscardReason::IdleLimit))
                } else {
                    tracing::debug!(%key, session = %session.id(), "session returned to pool");
                    entry.idle.push(IdleSession {
                        session,
                        since: Instant::now(),
                    });
                    Ok(())
                }
            }
        };

        match outcome {
            Ok(()) => Released::Pooled,
            Err((session, reason)) => {
                match reason {
                    DiscardReason::KeyMismatch | DiscardReason::NotCheckedOut => {
                        tracing::warn!(%key, session = %session.id(), ?reason, "released session discarded")
                    }
                    _ => tracing::debug!(%key, session = %session.id(), ?reason, "released session closed"),
                }
                let _ = session.close();
                Released::Discarded(reason)
            }
        }
    }

    /// Close and forget a checked-out session
    pub fn discard(&self, key: &PoolKey, session: TlsSession) {
        {
            let mut entries = self.lock();
            if !remove_busy(&mut entries, key, session.id()) {
                remove_busy(&mut entries, &PoolKey::for_session(&session), session.id());
            }
        }
        tracing::debug!(%key, session = %session.id(), "session discarded");
        let _ = session.close();
    }

    /// Close every idle session for `key`
    pub fn evict(&self, key: &PoolKey) -> usize {
        let sessions = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return 0;
            };
            let sessions: Vec<TlsSession> = entry.idle.drain(..).map(|i| i.session).collect();
            if entry.is_unused() {
                entries.remove(key);
            }
            sessions
        };
        let count = sessions.len();
        close_sessions(sessions, key, "idle session evicted");
        count
    }

    /// Close the idle sessions for `key` whose id is in `ids`
    pub fn evict_sessions(&self, key: &PoolKey, ids: &HashSet<SessionId>) -> usize {
        let sessions = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return 0;
            };
            let (evicted, kept): (Vec<_>, Vec<_>) = entry
                .idle
                .drain(..)
                .partition(|i| ids.contains(&i.session.id()));
            entry.idle = kept;
            if entry.is_unused() {
                entries.remove(key);
            }
            evicted.into_iter().map(|i| i.session).collect::<Vec<_>>()
        };
        let count = sessions.len();
        close_sessions(sessions, key, "idle session evicted");
        count
    }

    /// Ids of the idle sessions for `key`
    pub fn idle_ids(&self, key: &PoolKey) -> Vec<SessionId> {
        self.lock()
            .get(key)
            .map_or_else(Vec::new, |e| e.idle.iter().map(|i| i.session.id()).collect())
    }

    /// Close idle sessions past the idle timeout, across all keys
    pub fn purge_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut entries = self.lock();
            for (key, entry) in entries.iter_mut() {
                let (stale, fresh): (Vec<_>, Vec<_>) = entry.idle.drain(..).partition(|i| {
                    i.since.elapsed() >= self.config.idle_timeout || !i.session.is_open()
                });
                entry.idle = fresh;
                expired.extend(stale.into_iter().map(|i| (key.clone(), i.session)));
            }
            entries.retain(|_, entry| !entry.is_unused());
        }

        let count = expired.len();
        for (key, session) in expired {
            tracing::debug!(%key, session = %session.id(), "expired idle session closed");
            let _ = session.close();
        }
        count
    }

    /// Close every idle session
    ///
    /// Busy sessions stay with their requests and are closed when released.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<(PoolKey, TlsSession)> = {
            let mut entries = self.lock();
            let mut sessions = Vec::new();
            for (key, entry) in entries.iter_mut() {
                sessions.extend(entry.idle.drain(..).map(|i| (key.clone(), i.session)));
            }
            entries.retain(|_, entry| !entry.is_unused());
            sessions
        };

        let count = sessions.len();
        for (key, session) in sessions {
            tracing::debug!(%key, session = %session.id(), "idle session closed");
            let _ = session.close();
        }
        count
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.idle.len())
    }

    pub fn busy_count(&self, key: &PoolKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.busy.len())
    }

    /// Whether the pool tracks anything for `key`
    pub fn contains_key(&self, key: &PoolKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.lock();
        entries.values().fold(
            PoolStats {
                keys: entries.len(),
                ..PoolStats::default()
            },
            |mut stats, entry| {
                stats.idle += entry.idle.len();
                stats.busy += entry.busy.len();
                stats.pending += entry.pending;
                stats
            },
        )
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn remove_busy(entries: &mut HashMap<PoolKey, PoolEntry>, key: &PoolKey, id: SessionId) -> bool {
    let Some(entry) = entries.get_mut(key) else {
        return false;
    };
    let removed = entry.busy.remove(&id);
    if entry.is_unused() {
        entries.remove(key);
    }
    removed
}

fn close_sessions(sessions: Vec<TlsSession>, key: &PoolKey, message: &str) {
    for session in sessions {
        tracing::debug!(%key, session = %session.id(), "{}", message);
        let _ = session.close();
    }
}

/// A pending negotiation counted against its key's connection limit
///
/// Dropping the reservation without `complete` gives the slot back.
pub struct Reservation<'a> {
    pool: &'a ConnectionPool,
    key: PoolKey,
    active: bool,
}

impl Reservation<'_> {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Turn the reservation into a busy session
    pub fn complete(mut self, session: &TlsSession) {
        let mut entries = self.pool.lock();
        let entry = entries.entry(self.key.clone()).or_default();
        entry.pending = entry.pending.saturating_sub(1);
        entry.busy.insert(session.id());
        self.active = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let mut entries = self.pool.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.pending = entry.pending.saturating_sub(1);
            if entry.is_unused() {
                entries.remove(&self.key);
            }
        }
    }
}
