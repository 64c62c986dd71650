//! Blocked-decision telemetry.
//!
//! Counts blocked decisions per policy kind in process memory and, when a
//! collector URL is configured, posts each event to it in the background.
//! Delivery failures are logged and otherwise ignored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{GuardError, Result};
use crate::ratelimit::PolicyKind;

const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// A blocked rate limit decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedEvent {
    pub kind: PolicyKind,
    pub client_key: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Outbound HTTP delivery of blocked events.
#[derive(Debug, Clone)]
struct Collector {
    client: reqwest::Client,
    url: String,
}

impl Collector {
    fn dispatch(&self, event: BlockedEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(kind = %event.kind, "No async runtime, skipping telemetry delivery");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!(status = %response.status(), "Telemetry collector rejected event");
                }
                Ok(_) => trace!(kind = %event.kind, "Telemetry event delivered"),
                Err(e) => debug!(error = %e, "Telemetry delivery failed"),
            }
        });
    }
}

/// Sink for blocked-decision events.
#[derive(Debug, Default)]
pub struct TelemetrySink {
    blocked: DashMap<PolicyKind, u64>,
    last: DashMap<PolicyKind, BlockedEvent>,
    collector: Option<Collector>,
}

impl TelemetrySink {
    /// Sink that only counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that also forwards every event to `url`.
    pub fn with_collector(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COLLECTOR_TIMEOUT)
            .build()
            .map_err(|e| GuardError::Telemetry(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            blocked: DashMap::new(),
            last: DashMap::new(),
            collector: Some(Collector {
                client,
                url: url.to_string(),
            }),
        })
    }

    pub fn from_url(url: Option<&str>) -> Result<Self> {
        match url {
            Some(url) => Self::with_collector(url),
            None => Ok(Self::new()),
        }
    }

    /// Record one blocked decision made at `timestamp`. Never blocks on
    /// delivery.
    pub fn record_blocked(
        &self,
        kind: PolicyKind,
        client_key: &str,
        metadata: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) {
        *self.blocked.entry(kind).or_insert(0) += 1;

        debug!(kind = %kind, client_key = %client_key, "Rate limit blocked request");

        let event = BlockedEvent {
            kind,
            client_key: client_key.to_string(),
            metadata,
            timestamp,
        };
        self.last.insert(kind, event.clone());

        if let Some(collector) = &self.collector {
            collector.dispatch(event);
        }
    }

    pub fn blocked_count(&self, kind: PolicyKind) -> u64 {
        self.blocked.get(&kind).map(|count| *count).unwrap_or(0)
    }

    /// The most recent blocked event of `kind`.
    pub fn last_blocked(&self, kind: PolicyKind) -> Option<BlockedEvent> {
        self.last.get(&kind).map(|event| event.clone())
    }

    /// Zero every counter.
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        self.blocked.clear();
        self.last.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts_per_kind() {
        let sink = TelemetrySink::new();
        sink.record_blocked(PolicyKind::Login, "ip:1.1.1.1", Map::new(), Utc::now());
        sink.record_blocked(PolicyKind::Login, "ip:1.1.1.1", Map::new(), Utc::now());
        sink.record_blocked(PolicyKind::CspReport, "ua:abc", Map::new(), Utc::now());

        assert_eq!(sink.blocked_count(PolicyKind::Login), 2);
        assert_eq!(sink.blocked_count(PolicyKind::CspReport), 1);
        assert_eq!(sink.blocked_count(PolicyKind::SignIn), 0);
    }

    #[test]
    fn test_reset() {
        let sink = TelemetrySink::new();
        sink.record_blocked(PolicyKind::SignOut, "c", Map::new(), Utc::now());
        sink.reset();
        assert_eq!(sink.blocked_count(PolicyKind::SignOut), 0);
        assert!(sink.last_blocked(PolicyKind::SignOut).is_none());
    }

    #[test]
    fn test_event_keeps_caller_timestamp() {
        let sink = TelemetrySink::new();
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        sink.record_blocked(PolicyKind::Login, "ip:1.1.1.1", Map::new(), at);

        let event = sink.last_blocked(PolicyKind::Login).unwrap();
        assert_eq!(event.timestamp, at);
        assert_eq!(event.client_key, "ip:1.1.1.1");
        assert!(sink.last_blocked(PolicyKind::CspReport).is_none());
    }

    #[test]
    fn test_event_schema() {
        let mut metadata = Map::new();
        metadata.insert("limit".to_string(), json!(5));
        let event = BlockedEvent {
            kind: PolicyKind::PublicAccess,
            client_key: "ip:9.9.9.9".to_string(),
            metadata,
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "public_access");
        assert_eq!(value["clientKey"], "ip:9.9.9.9");
        assert_eq!(value["metadata"]["limit"], 5);
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_collector_outside_runtime_is_swallowed() {
        let sink = TelemetrySink::with_collector("http://127.0.0.1:9/events").unwrap();
        sink.record_blocked(PolicyKind::Login, "c", Map::new(), Utc::now());
        assert_eq!(sink.blocked_count(PolicyKind::Login), 1);
    }

    #[tokio::test]
    async fn test_unreachable_collector_does_not_affect_caller() {
        let sink = TelemetrySink::from_url(Some("http://127.0.0.1:9/events")).unwrap();
        for _ in 0..3 {
            sink.record_blocked(PolicyKind::SignIn, "c", Map::new(), Utc::now());
        }
        assert_eq!(sink.blocked_count(PolicyKind::SignIn), 3);
    }
}
