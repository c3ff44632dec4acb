//! Caller-facing HTTPS client
//!
//! `HttpsClient` owns the certificate policy, the certificate store, the
//! server certificate validator and a `RequestDispatcher`. Reusing one
//! client across requests lets its pool skip handshakes; a fresh client per
//! request starts with an empty pool unless one is shared explicitly.

use super::dispatch::{DispatchError, Request, RequestDispatcher, Response, DEFAULT_REQUEST_TIMEOUT};
use super::pool::{ConnectionPool, PoolConfig};
use super::tls::{
    CancelToken, CertFingerprint, CertInfo, CertificatePolicy, CertificateStore, ClientCertificate,
    HandshakeNegotiator, NegotiatorStats, PeerCertificate, PlatformCertificateSource, PolicyErrors,
    ServerCertificateValidator, TlsClientConfig, TlsConfig, TlsError,
};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// HTTPS client with client-certificate aware connection pooling
pub struct HttpsClient {
    policy: RwLock<CertificatePolicy>,
    store: CertificateStore,
    validator: Option<ServerCertificateValidator>,
    dispatcher: RequestDispatcher,
}

impl HttpsClient {
    pub fn builder() -> HttpsClientBuilder {
        HttpsClientBuilder::default()
    }

    /// Client with default settings and no client certificates
    pub fn new() -> Result<Self, TlsError> {
        Self::builder().build()
    }

    pub fn policy(&self) -> CertificatePolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: CertificatePolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        tracing::debug!(%policy, "certificate policy changed");
    }

    /// Set the policy from its raw value, leaving it unchanged on error
    pub fn set_policy_raw(&self, raw: i32) -> Result<(), TlsError> {
        let policy = CertificatePolicy::try_from(raw)?;
        self.set_policy(policy);
        Ok(())
    }

    /// Add a certificate for the Manual policy
    pub fn add_certificate(&self, cert: impl Into<Arc<ClientCertificate>>) -> Result<(), TlsError> {
        if self.policy() == CertificatePolicy::Automatic {
            return Err(TlsError::InvalidConfig(
                "certificates cannot be added under the automatic policy".to_string(),
            ));
        }
        self.store.add(cert);
        Ok(())
    }

    pub fn remove_certificate(&self, fingerprint: &CertFingerprint) -> bool {
        self.store.remove(fingerprint)
    }

    /// Manually added certificates, in insertion order
    pub fn certificates(&self) -> Vec<Arc<ClientCertificate>> {
        self.store.manual()
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn validator(&self) -> Option<&ServerCertificateValidator> {
        self.validator.as_ref()
    }

    pub fn send(&self, request: &Request) -> Result<Response, DispatchError> {
        self.dispatcher.send(request, self)
    }

    pub fn send_cancellable(&self, request: &Request, cancel: &CancelToken) -> Result<Response, DispatchError> {
        self.dispatcher.send_cancellable(request, self, cancel)
    }

    pub fn get(&self, url: &str) -> Result<Response, DispatchError> {
        self.send(&Request::get(url)?)
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.dispatcher.pool()
    }

    pub fn negotiator_stats(&self) -> NegotiatorStats {
        self.dispatcher.negotiator().stats()
    }

    /// Close the idle sessions this client left in its pool
    pub fn close(&self) -> usize {
        self.dispatcher.close()
    }
}

impl std::fmt::Debug for HttpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsClient")
            .field("policy", &self.policy())
            .field("store", &self.store)
            .field("validator", &self.validator.is_some())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Builder for `HttpsClient`
pub struct HttpsClientBuilder {
    policy: CertificatePolicy,
    certificates: Vec<Arc<ClientCertificate>>,
    platform: Option<Arc<dyn PlatformCertificateSource>>,
    validator: Option<ServerCertificateValidator>,
    tls: Option<TlsClientConfig>,
    pool_config: PoolConfig,
    pool: Option<Arc<ConnectionPool>>,
    request_timeout: Duration,
    retry_stale: bool,
}

impl Default for HttpsClientBuilder {
    fn default() -> Self {
        HttpsClientBuilder {
            policy: CertificatePolicy::default(),
            certificates: Vec::new(),
            platform: None,
            validator: None,
            tls: None,
            pool_config: PoolConfig::default(),
            pool: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_stale: true,
        }
    }
}

impl HttpsClientBuilder {
    pub fn policy(mut self, policy: CertificatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a certificate for the Manual policy
    pub fn certificate(mut self, cert: impl Into<Arc<ClientCertificate>>) -> Self {
        self.certificates.push(cert.into());
        self
    }

    /// Certificate discovery for the Automatic policy
    pub fn platform_source(mut self, source: impl PlatformCertificateSource + 'static) -> Self {
        self.platform = Some(Arc::new(source));
        self
    }

    /// Decide on the server certificate
    ///
    /// Without a validator only certificates OpenSSL verifies cleanly,
    /// including the host name check, are accepted.
    pub fn server_certificate_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PeerCertificate, &[CertInfo], &PolicyErrors) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Use a validator instance shared with other clients
    ///
    /// Sessions only pool across clients holding the same instance.
    pub fn shared_validator(mut self, validator: ServerCertificateValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn tls_config(mut self, config: TlsClientConfig) -> Self {
        self.tls = Some(config);
        self
    }

    /// Configuration for the client's own pool
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Use a pool shared with other clients instead of an own one
    ///
    /// Pool keys include the validator instance and the trust settings, so
    /// clients that validate servers differently never share a session.
    pub fn shared_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retry idempotent requests once when a pooled session is stale (on by default)
    pub fn retry_stale(mut self, enabled: bool) -> Self {
        self.retry_stale = enabled;
        self
    }

    pub fn build(self) -> Result<HttpsClient, TlsError> {
        if self.policy == CertificatePolicy::Automatic && !self.certificates.is_empty() {
            return Err(TlsError::InvalidConfig(
                "certificates cannot be added under the automatic policy".to_string(),
            ));
        }

        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsConfig::client().build()?,
        };
        let store = match self.platform {
            Some(platform) => CertificateStore::with_platform_source(platform),
            None => CertificateStore::new(),
        };
        for cert in self.certificates {
            store.add(cert);
        }
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(ConnectionPool::new(self.pool_config)));
        let dispatcher = RequestDispatcher::new(HandshakeNegotiator::new(tls), pool)
            .with_request_timeout(self.request_timeout)
            .with_retry_stale(self.retry_stale);

        Ok(HttpsClient {
            policy: RwLock::new(self.policy),
            store,
            validator: self.validator,
            dispatcher,
        })
    }
}
