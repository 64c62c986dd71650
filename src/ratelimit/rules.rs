//! Policy definitions and their validation.
//!
//! A [`PolicySet`] is built once at startup from [`GuardConfig`]. Malformed
//! thresholds or windows fail here, before any traffic is served.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::descriptor::{KeyNamespace, PolicyKey};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};

/// Longest window a policy may declare.
const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

const MINUTE: u64 = 60;

/// The protected use cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Public slug / QR landing page lookups
    PublicAccess,
    /// Credential login attempts
    Login,
    /// Visitor sign-in submissions for a site
    SignIn,
    /// Sign-out by emailed or printed token
    SignOut,
    /// Content-Security-Policy violation reports
    CspReport,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 5] = [
        PolicyKind::PublicAccess,
        PolicyKind::Login,
        PolicyKind::SignIn,
        PolicyKind::SignOut,
        PolicyKind::CspReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::PublicAccess => "public_access",
            PolicyKind::Login => "login",
            PolicyKind::SignIn => "sign_in",
            PolicyKind::SignOut => "sign_out",
            PolicyKind::CspReport => "csp_report",
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a policy does when its distributed backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Degrade to the local fallback store
    FailOpen,
    /// Refuse the request with an error
    FailClosed,
}

/// Which discriminators a threshold's key is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// The client key alone
    Client,
    /// The client key and the policy subject (email, site, token prefix)
    ClientAndSubject,
    /// The policy subject alone, shared by every client
    Subject,
}

/// One threshold of a policy. Every threshold must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Threshold {
    /// Backend prefix of this threshold's counters
    pub prefix: &'static str,
    /// Requests allowed per window
    pub limit: u32,
    pub scope: KeyScope,
}

/// Static configuration of one protected use case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub kind: PolicyKind,
    pub window_secs: u64,
    pub thresholds: Vec<Threshold>,
    pub failure_mode: FailureMode,
}

impl Policy {
    fn new(
        kind: PolicyKind,
        window_secs: u64,
        thresholds: Vec<Threshold>,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        if window_secs == 0 || window_secs > MAX_WINDOW_SECS {
            return Err(GuardError::Config(format!(
                "{} window must be between 1 and {} seconds, got {}",
                kind, MAX_WINDOW_SECS, window_secs
            )));
        }
        if thresholds.is_empty() {
            return Err(GuardError::Config(format!("{} has no thresholds", kind)));
        }
        if let Some(threshold) = thresholds.iter().find(|t| t.limit == 0) {
            return Err(GuardError::Config(format!(
                "{} threshold {} must be positive",
                kind, threshold.prefix
            )));
        }

        Ok(Self {
            kind,
            window_secs,
            thresholds,
            failure_mode,
        })
    }

    pub fn window(&self) -> TimeDelta {
        TimeDelta::seconds(self.window_secs as i64)
    }

    /// The tightest threshold, used for exempt results.
    pub fn min_limit(&self) -> u32 {
        self.thresholds.iter().map(|t| t.limit).min().unwrap_or(0)
    }

    /// Build the counter key of every threshold.
    pub fn keys(
        &self,
        namespace: &KeyNamespace,
        client_key: &str,
        subject: &str,
    ) -> Vec<(PolicyKey, u32)> {
        self.thresholds
            .iter()
            .map(|threshold| {
                let parts: Vec<&str> = match threshold.scope {
                    KeyScope::Client => vec![client_key],
                    KeyScope::ClientAndSubject => vec![client_key, subject],
                    KeyScope::Subject => vec![subject],
                };
                (
                    PolicyKey::new(namespace, threshold.prefix, parts),
                    threshold.limit,
                )
            })
            .collect()
    }
}

fn threshold(prefix: &'static str, limit: u32, scope: KeyScope) -> Threshold {
    Threshold {
        prefix,
        limit,
        scope,
    }
}

/// The full, validated set of policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySet {
    pub public_access: Policy,
    pub login: Policy,
    pub sign_in: Policy,
    pub sign_out: Policy,
    pub csp_report: Policy,
}

impl PolicySet {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        if config.backend_timeout_ms == 0 {
            return Err(GuardError::Config(
                "rl_backend_timeout_ms must be positive".to_string(),
            ));
        }
        if config.local_sweep_secs == 0 {
            return Err(GuardError::Config(
                "rl_local_sweep_secs must be positive".to_string(),
            ));
        }

        Ok(Self {
            public_access: Policy::new(
                PolicyKind::PublicAccess,
                MINUTE,
                vec![threshold("public", config.public_per_min, KeyScope::Client)],
                FailureMode::FailOpen,
            )?,
            login: Policy::new(
                PolicyKind::Login,
                config.login_window_secs,
                vec![threshold(
                    "login",
                    config.login_max_attempts,
                    KeyScope::ClientAndSubject,
                )],
                FailureMode::FailClosed,
            )?,
            sign_in: Policy::new(
                PolicyKind::SignIn,
                MINUTE,
                vec![
                    threshold(
                        "signin-client",
                        config.signin_per_client_per_min,
                        KeyScope::ClientAndSubject,
                    ),
                    threshold(
                        "signin-site",
                        config.signin_per_site_per_min,
                        KeyScope::Subject,
                    ),
                ],
                FailureMode::FailOpen,
            )?,
            sign_out: Policy::new(
                PolicyKind::SignOut,
                MINUTE,
                vec![threshold(
                    "signout",
                    config.signout_per_min,
                    KeyScope::ClientAndSubject,
                )],
                FailureMode::FailOpen,
            )?,
            csp_report: Policy::new(
                PolicyKind::CspReport,
                MINUTE,
                vec![threshold("csp", config.csp_report_per_min, KeyScope::Client)],
                FailureMode::FailOpen,
            )?,
        })
    }

    pub fn get(&self, kind: PolicyKind) -> &Policy {
        match kind {
            PolicyKind::PublicAccess => &self.public_access,
            PolicyKind::Login => &self.login,
            PolicyKind::SignIn => &self.sign_in,
            PolicyKind::SignOut => &self.sign_out,
            PolicyKind::CspReport => &self.csp_report,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        PolicyKind::ALL.into_iter().map(move |kind| self.get(kind))
    }
}
