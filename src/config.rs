//! Configuration management for the guard engine.
//!
//! Every setting is environment-style: the serde names are the lowercased
//! environment variable names, so the same keys work from the process
//! environment and from a YAML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GuardError, Result};
use crate::ratelimit::RequestHeaders;

/// Header a test runner sends to opt a single request into the bypass.
pub const BYPASS_HEADER: &str = "x-rate-limit-bypass";

/// Main configuration for the guard engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Public slug lookups allowed per client per minute
    #[serde(rename = "rl_public_slug_per_ip_per_min", default = "default_public_per_min")]
    pub public_per_min: u32,

    /// Login attempts allowed per client and email per login window
    #[serde(rename = "rl_login_max_attempts", default = "default_login_attempts")]
    pub login_max_attempts: u32,

    /// Login window in seconds
    #[serde(rename = "rl_login_window_secs", default = "default_login_window_secs")]
    pub login_window_secs: u64,

    /// Sign-in submissions allowed per client and site per minute
    #[serde(rename = "rl_signin_per_ip_per_min", default = "default_signin_per_ip")]
    pub signin_per_client_per_min: u32,

    /// Sign-in submissions allowed per site per minute, across all clients
    #[serde(rename = "rl_signin_per_site_per_min", default = "default_signin_per_site")]
    pub signin_per_site_per_min: u32,

    /// Token sign-outs allowed per client per minute
    #[serde(rename = "rl_signout_per_ip_per_min", default = "default_signout_per_ip")]
    pub signout_per_min: u32,

    /// CSP reports accepted per client per minute
    #[serde(rename = "csp_report_rl_per_min", default = "default_csp_per_min")]
    pub csp_report_per_min: u32,

    /// Distributed backend connection URL; unset means local-only mode
    #[serde(rename = "rl_redis_url", default)]
    pub redis_url: Option<String>,

    /// Upper bound on a single backend round-trip
    #[serde(rename = "rl_backend_timeout_ms", default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Interval between sweeps of expired local counters
    #[serde(rename = "rl_local_sweep_secs", default = "default_sweep_secs")]
    pub local_sweep_secs: u64,

    /// Collector receiving blocked events
    #[serde(rename = "rl_telemetry_url", default)]
    pub telemetry_url: Option<String>,

    /// Whether forwarded-address headers come from a trusted reverse proxy
    #[serde(rename = "trust_proxy", default)]
    pub trust_proxy: bool,

    /// Deployment environment; `production` disables every bypass
    #[serde(rename = "app_env", default = "default_app_env")]
    pub app_env: String,

    /// Allow test runners to skip rate limiting outside production
    #[serde(rename = "allow_test_runner_bypass", default)]
    pub allow_test_runner_bypass: bool,

    /// Whether the bypass also needs the per-request opt-in header
    #[serde(rename = "rl_bypass_require_header", default = "default_true")]
    pub bypass_require_header: bool,

    /// Running under continuous integration
    #[serde(rename = "ci", default)]
    pub ci: bool,

    /// Identifier of the current CI test run
    #[serde(rename = "test_run_id", default)]
    pub test_run_id: Option<String>,

    /// Opt-in to namespacing every key by the CI test run
    #[serde(rename = "rl_namespace_test_runs", default)]
    pub namespace_test_runs: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            public_per_min: default_public_per_min(),
            login_max_attempts: default_login_attempts(),
            login_window_secs: default_login_window_secs(),
            signin_per_client_per_min: default_signin_per_ip(),
            signin_per_site_per_min: default_signin_per_site(),
            signout_per_min: default_signout_per_ip(),
            csp_report_per_min: default_csp_per_min(),
            redis_url: None,
            backend_timeout_ms: default_backend_timeout_ms(),
            local_sweep_secs: default_sweep_secs(),
            telemetry_url: None,
            trust_proxy: false,
            app_env: default_app_env(),
            allow_test_runner_bypass: false,
            bypass_require_header: true,
            ci: false,
            test_run_id: None,
            namespace_test_runs: false,
        }
    }
}

fn default_public_per_min() -> u32 {
    10
}

fn default_login_attempts() -> u32 {
    5
}

fn default_login_window_secs() -> u64 {
    15 * 60
}

fn default_signin_per_ip() -> u32 {
    30
}

fn default_signin_per_site() -> u32 {
    200
}

fn default_signout_per_ip() -> u32 {
    30
}

fn default_csp_per_min() -> u32 {
    60
}

fn default_backend_timeout_ms() -> u64 {
    1500
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_app_env() -> String {
    "development".to_string()
}

fn default_true() -> bool {
    true
}

impl GuardConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Load configuration from an explicit variable map instead of the
    /// process environment.
    pub fn from_env_map<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_environment(config::Environment::default().source(Some(map)))
    }

    fn from_environment(source: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(source.try_parsing(true))
            .build()?
            .try_deserialize::<GuardConfig>()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading guard configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse guard config: {}", e)))
    }

    /// The backend URL, treating an empty value as absent.
    pub fn redis_url(&self) -> Option<&str> {
        non_empty(self.redis_url.as_deref())
    }

    /// The telemetry collector URL, treating an empty value as absent.
    pub fn telemetry_url(&self) -> Option<&str> {
        non_empty(self.telemetry_url.as_deref())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.local_sweep_secs)
    }

    pub fn is_production(&self) -> bool {
        self.app_env.trim().eq_ignore_ascii_case("production")
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// How the current deployment treats test-runner bypass requests.
///
/// Resolved once from configuration and applied identically by every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvironmentPolicy {
    /// Bypass is available at all in this environment
    pub bypass_all: bool,
    /// A request must also carry [`BYPASS_HEADER`] to be bypassed
    pub require_opt_in_header: bool,
}

impl EnvironmentPolicy {
    /// No bypass under any circumstances.
    pub fn strict() -> Self {
        Self {
            bypass_all: false,
            require_opt_in_header: true,
        }
    }

    pub fn resolve(config: &GuardConfig) -> Self {
        if config.is_production() || !config.allow_test_runner_bypass {
            return Self::strict();
        }

        Self {
            bypass_all: true,
            require_opt_in_header: config.bypass_require_header,
        }
    }

    /// Whether the request described by `headers` skips rate limiting.
    pub fn permits_bypass(&self, headers: &RequestHeaders) -> bool {
        if !self.bypass_all {
            return false;
        }
        if !self.require_opt_in_header {
            return true;
        }

        matches!(
            headers.get(BYPASS_HEADER).map(|v| v.trim().to_ascii_lowercase()),
            Some(ref v) if v == "1" || v == "true"
        )
    }
}
