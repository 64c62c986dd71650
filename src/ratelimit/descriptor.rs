//! Composite policy key generation.

use crate::config::GuardConfig;

/// Root segment shared by every policy key.
const KEY_ROOT: &str = "rl";

/// Prefix isolating the counters of one CI test run from every other run.
///
/// Only active when running in CI, a run identifier is present, and the
/// explicit opt-in flag is set; otherwise empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamespace(Option<String>);

impl KeyNamespace {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn for_test_run(run_id: &str) -> Self {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Self::none();
        }
        Self(Some(format!("test:{}:", run_id)))
    }

    pub fn resolve(config: &GuardConfig) -> Self {
        match (&config.test_run_id, config.ci && config.namespace_test_runs) {
            (Some(run_id), true) => Self::for_test_run(run_id),
            _ => Self::none(),
        }
    }

    /// The literal prefix, empty when no namespace is active.
    pub fn as_prefix(&self) -> &str {
        self.0.as_deref().unwrap_or_default()
    }
}

/// A key that uniquely identifies one counter of one policy.
///
/// Rendered as `[namespace]rl:<policy-prefix>:<part>:<part>...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    /// Namespace prefix, possibly empty
    pub namespace: String,
    /// Backend prefix of the owning policy scope
    pub prefix: String,
    /// Discriminators in a fixed order
    pub parts: Vec<String>,
}

impl PolicyKey {
    pub fn new<I, S>(namespace: &KeyNamespace, prefix: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.as_prefix().to_string(),
            prefix: prefix.to_string(),
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// Convert the key to the string stored in a counter backend.
    pub fn to_string_key(&self) -> String {
        let mut key = format!("{}{}:{}", self.namespace, KEY_ROOT, self.prefix);
        for part in &self.parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
