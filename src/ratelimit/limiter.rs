//! Policy engine: one evaluator per protected use case.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::backend::{CounterBackend, RateLimitResult};
use super::clock::{Clock, SystemClock};
use super::counter::LocalStore;
use super::descriptor::{KeyNamespace, PolicyKey};
use super::distributed::BackendSlot;
use super::identity::{redact_email, resolve_client_key, RequestHeaders};
use super::rules::{FailureMode, Policy, PolicyKind, PolicySet};
use crate::config::{EnvironmentPolicy, GuardConfig};
use crate::error::{BackendError, GuardError, Result};
use crate::telemetry::TelemetrySink;

/// Characters of a sign-out token that take part in its key.
const TOKEN_PREFIX_LEN: usize = 8;

/// Request metadata handed over by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: RequestHeaders,
    /// Explicit client key, skipping header-based resolution
    pub client_key: Option<String>,
    /// Correlation id for logs and telemetry
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(headers: RequestHeaders) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    /// Context for internal callers that already know the client key.
    pub fn for_client(client_key: &str) -> Self {
        Self::default().with_client_key(client_key)
    }

    pub fn with_client_key(mut self, client_key: &str) -> Self {
        self.client_key = Some(client_key.to_string());
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }
}

/// Everything the engine shares across requests.
///
/// Built once at startup and owned by the [`RateLimitEngine`].
#[derive(Debug)]
pub struct GuardContext {
    pub backend: BackendSlot,
    pub local: Arc<LocalStore>,
    pub telemetry: TelemetrySink,
    pub clock: Arc<dyn Clock>,
    pub environment: EnvironmentPolicy,
    pub namespace: KeyNamespace,
    pub trust_proxy: bool,
    pub backend_timeout: Duration,
}

impl GuardContext {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = Arc::new(LocalStore::new(clock.clone(), config.sweep_interval()));

        // Without a runtime the opportunistic sweep in `increment` still runs
        if tokio::runtime::Handle::try_current().is_ok() {
            LocalStore::spawn_sweeper(&local, config.sweep_interval());
        }

        Ok(Self {
            backend: BackendSlot::from_config(config),
            local,
            telemetry: TelemetrySink::from_url(config.telemetry_url())?,
            clock,
            environment: EnvironmentPolicy::resolve(config),
            namespace: KeyNamespace::resolve(config),
            trust_proxy: config.trust_proxy,
            backend_timeout: config.backend_timeout(),
        })
    }

    /// Local-only context on the given clock, with no bypass and no namespace.
    pub fn local(clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: BackendSlot::disabled(),
            local: Arc::new(LocalStore::new(clock.clone(), Duration::from_secs(60))),
            telemetry: TelemetrySink::new(),
            clock,
            environment: EnvironmentPolicy::strict(),
            namespace: KeyNamespace::none(),
            trust_proxy: false,
            backend_timeout: Duration::from_millis(1500),
        }
    }

    pub fn with_backend(mut self, backend: BackendSlot) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_local_store(mut self, local: Arc<LocalStore>) -> Self {
        self.local = local;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentPolicy) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_namespace(mut self, namespace: KeyNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }
}

/// The rate limit engine gating every untrusted entry point.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimitEngine {
    policies: PolicySet,
    context: GuardContext,
}

impl RateLimitEngine {
    pub fn new(policies: PolicySet, context: GuardContext) -> Self {
        Self { policies, context }
    }

    /// Validate the configuration and build the engine. Fails on malformed
    /// policy settings.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let policies = PolicySet::from_config(config)?;
        let context = GuardContext::from_config(config)?;
        Ok(Self::new(policies, context))
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn context(&self) -> &GuardContext {
        &self.context
    }

    /// Public slug / QR page access, keyed by client.
    pub async fn check_public_access(&self, request: &RequestContext) -> Result<RateLimitResult> {
        self.check(PolicyKind::PublicAccess, request, "").await
    }

    /// Login attempts, keyed by client and case-insensitive email.
    pub async fn check_login(&self, request: &RequestContext, email: &str) -> Result<RateLimitResult> {
        self.check(PolicyKind::Login, request, email).await
    }

    /// Sign-in submissions, limited per client+site and per site.
    pub async fn check_sign_in(&self, request: &RequestContext, site_id: &str) -> Result<RateLimitResult> {
        self.check(PolicyKind::SignIn, request, site_id).await
    }

    /// Sign-out by token, keyed by client and token prefix.
    pub async fn check_sign_out(&self, request: &RequestContext, token: &str) -> Result<RateLimitResult> {
        self.check(PolicyKind::SignOut, request, token).await
    }

    /// CSP violation report ingestion, keyed by client.
    pub async fn check_csp_report(&self, request: &RequestContext) -> Result<RateLimitResult> {
        self.check(PolicyKind::CspReport, request, "").await
    }

    /// Evaluate the policy of `kind` for one request.
    ///
    /// `subject` is the policy discriminator: email for login, site id for
    /// sign-in, token for sign-out, ignored otherwise. Only a backend failure
    /// on a fail-closed policy returns an error.
    pub async fn check(
        &self,
        kind: PolicyKind,
        request: &RequestContext,
        subject: &str,
    ) -> Result<RateLimitResult> {
        let policy = self.policies.get(kind);
        let now = self.context.clock.now();

        if self.context.environment.permits_bypass(&request.headers) {
            debug!(policy = %kind, "Rate limit bypassed for test runner");
            return Ok(RateLimitResult::unlimited(policy.min_limit(), now));
        }

        let client_key = match &request.client_key {
            Some(key) => key.clone(),
            None => resolve_client_key(&request.headers, self.context.trust_proxy),
        };
        let subject = normalize_subject(kind, subject);
        let keys = policy.keys(&self.context.namespace, &client_key, &subject);
        let request_id = request.request_id.as_deref().unwrap_or("-");

        trace!(
            policy = %kind,
            client_key = %client_key,
            request_id = %request_id,
            checks = keys.len(),
            "Checking rate limit"
        );

        let (results, tier) = match self.context.backend.get() {
            Some(backend) => match self.check_distributed(backend.as_ref(), policy, &keys, now).await {
                Ok(results) => (results, "distributed"),
                Err(e) => match policy.failure_mode {
                    FailureMode::FailOpen => {
                        warn!(
                            policy = %kind,
                            client_key = %client_key,
                            request_id = %request_id,
                            error = %e,
                            "Distributed backend failed, falling back to local counters"
                        );
                        (self.check_local(policy, &keys), "local")
                    }
                    FailureMode::FailClosed => {
                        error!(
                            policy = %kind,
                            client_key = %client_key,
                            request_id = %request_id,
                            error = %e,
                            "Distributed backend failed, refusing request"
                        );
                        return Err(GuardError::Backend {
                            policy: kind.as_str(),
                            source: e,
                        });
                    }
                },
            },
            None => (self.check_local(policy, &keys), "local"),
        };

        let result = RateLimitResult::combine(results)
            .ok_or_else(|| GuardError::Config(format!("{} has no thresholds", kind)))?;

        if result.success {
            trace!(policy = %kind, remaining = result.remaining, tier = tier, "Rate limit check passed");
        } else {
            let mut metadata = Map::new();
            metadata.insert("limit".to_string(), json!(result.limit));
            metadata.insert("reset".to_string(), json!(result.reset.to_rfc3339()));
            metadata.insert("tier".to_string(), json!(tier));
            if let Some(request_id) = &request.request_id {
                metadata.insert("requestId".to_string(), json!(request_id));
            }
            if !subject.is_empty() {
                metadata.insert("subject".to_string(), Value::String(loggable_subject(kind, &subject)));
            }

            self.context
                .telemetry
                .record_blocked(kind, &client_key, metadata, now);
        }

        Ok(result)
    }

    async fn check_distributed(
        &self,
        backend: &dyn CounterBackend,
        policy: &Policy,
        keys: &[(PolicyKey, u32)],
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<RateLimitResult>, BackendError> {
        let window = policy.window();
        let timeout = self.context.backend_timeout;

        let checks = keys.iter().map(|(key, limit)| async move {
            let key = key.to_string_key();
            let hit = tokio::time::timeout(timeout, backend.hit(&key, *limit, window, now))
                .await
                .map_err(|_| BackendError::Timeout(timeout.as_millis() as u64))??;
            Ok::<_, BackendError>(RateLimitResult::from_hit(*limit, hit))
        });

        futures::future::try_join_all(checks).await
    }

    fn check_local(&self, policy: &Policy, keys: &[(PolicyKey, u32)]) -> Vec<RateLimitResult> {
        let window = policy.window();
        keys.iter()
            .map(|(key, limit)| {
                let entry = self.context.local.increment(&key.to_string_key(), window);
                RateLimitResult::from_count(*limit, entry.count, entry.reset_at)
            })
            .collect()
    }
}

fn normalize_subject(kind: PolicyKind, subject: &str) -> String {
    let subject = subject.trim();
    match kind {
        PolicyKind::Login => subject.to_lowercase(),
        PolicyKind::SignOut => subject.chars().take(TOKEN_PREFIX_LEN).collect(),
        PolicyKind::SignIn => subject.to_string(),
        PolicyKind::PublicAccess | PolicyKind::CspReport => String::new(),
    }
}

fn loggable_subject(kind: PolicyKind, subject: &str) -> String {
    match kind {
        PolicyKind::Login => redact_email(subject),
        _ => subject.to_string(),
    }
}
