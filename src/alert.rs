//! Alert data model: the canonical in-memory record and the wire shapes
//! producers deliver.
//!
//! Producers send one of three envelope shapes: the Prometheus alertmanager
//! webhook (`version`, `groupKey`, `alerts[]`), the Grafana unified-alerting
//! webhook (same skeleton plus `orgId`, `state`, `title` and per-alert
//! `silenceURL`/`dashboardURL`/`panelURL`/`values`), or a single inline alert
//! object. [`crate::normalizer`] turns any of them into [`Alert`] records.

use crate::prelude::*;

use std::collections::BTreeMap;

use serde_json::Value;
use time::OffsetDateTime;
use time::macros::datetime;

/// Producer label key carrying the alert name.
pub const LABEL_ALERTNAME: &str = "alertname";
/// Gateway-owned label naming the producer that delivered the alert.
pub const LABEL_SOURCE: &str = "_source";
/// Gateway-owned label carrying the producer's receiver name, when sent.
pub const LABEL_RECEIVER: &str = "_receiver";

/// The "open" timestamp sentinel: an alert whose `endsAt` equals this value
/// has not ended yet.
#[must_use]
pub const fn open_sentinel() -> OffsetDateTime {
    datetime!(0001-01-01 0:00 UTC)
}

/// Possible states of an alert.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum AlertStatus {
    /// The producer informed us that alert conditions are no longer satisfied
    #[serde(rename = "resolved")]
    Resolved,
    /// The producer informed us that alert conditions are satisfied
    #[serde(rename = "firing")]
    #[default]
    Firing,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use AlertStatus::*;
        match self {
            Resolved => write!(fmt, "resolved"),
            Firing => write!(fmt, "firing"),
        }
    }
}

impl AlertStatus {
    /// Emoji marker used by the shipped templates.
    #[must_use]
    pub const fn into_emoji(self) -> &'static str {
        use AlertStatus::*;
        match self {
            Firing => "🔥",
            Resolved => "🩷",
        }
    }
}

/// Canonical alert record.
///
/// Produced by [`crate::normalizer`], immutable afterwards. `labels` always
/// carries `alertname` and `_source`; keys starting with `_` are reserved for
/// the gateway and stripped from producer input.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub status: AlertStatus,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(rename = "silenceURL", skip_serializing_if = "Option::is_none")]
    pub silence_url: Option<String>,
    #[serde(rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(rename = "panelURL", skip_serializing_if = "Option::is_none")]
    pub panel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    /// Entities (pods/instances/…) the normalizer collapsed into this alert.
    #[serde(rename = "merged_entities", skip_serializing_if = "Vec::is_empty")]
    pub merged_entities: Vec<String>,
}

impl Alert {
    /// The `alertname` label, or an empty string when the producer sent none.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get(LABEL_ALERTNAME).map_or("", String::as_str)
    }

    /// The `_source` label set by the normalizer.
    #[must_use]
    pub fn source(&self) -> &str {
        self.labels.get(LABEL_SOURCE).map_or("", String::as_str)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    /// Whether `endsAt` still holds the open sentinel.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ends_at == open_sentinel()
    }
}

/// Per-alert wire shape, common to both producers.
///
/// Every field is optional on the wire; missing timestamps decode to the open
/// sentinel, missing status to `firing`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAlert {
    #[serde(default)]
    pub status: AlertStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default = "open_sentinel", with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(default = "open_sentinel", with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    #[serde(rename = "generatorURL", default)]
    pub generator_url: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(rename = "silenceURL", default)]
    pub silence_url: Option<String>,
    #[serde(rename = "dashboardURL", default)]
    pub dashboard_url: Option<String>,
    #[serde(rename = "panelURL", default)]
    pub panel_url: Option<String>,
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(default)]
    pub value_string: Option<String>,
}

/// Envelope wrapper common to the Prometheus and Grafana webhook payloads.
///
/// Per-alert entries stay as raw [`Value`]s so that one malformed entry can
/// be skipped without rejecting its siblings.
#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerEnvelope {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub group_key: Option<String>,
    #[serde(default)]
    pub status: Option<AlertStatus>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub org_id: Option<i64>,
    #[serde(default)]
    pub group_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
    #[serde(rename = "externalURL", default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub truncated_alerts: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub alerts: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_alert_decodes_prometheus_entry() {
        let alert: WireAlert = serde_json::from_value(json!({
            "status": "firing",
            "labels": {"alertname": "HighCPU", "severity": "critical"},
            "annotations": {"summary": "cpu is high"},
            "startsAt": "2024-01-15T10:30:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "generatorURL": "http://prom:9090/graph?g0.expr=cpu"
        }))
        .unwrap();

        assert_eq!(alert.status, AlertStatus::Firing);
        assert_eq!(alert.labels["alertname"], "HighCPU");
        assert_eq!(alert.ends_at, open_sentinel());
        assert!(alert.generator_url.contains("g0.expr"));
        assert!(alert.fingerprint.is_none());
    }

    #[test]
    fn wire_alert_decodes_grafana_extras() {
        let alert: WireAlert = serde_json::from_value(json!({
            "status": "resolved",
            "labels": {"alertname": "X"},
            "startsAt": "2024-01-15T10:30:00Z",
            "endsAt": "2024-01-15T10:35:00Z",
            "fingerprint": "abcdef",
            "silenceURL": "http://grafana/silence",
            "valueString": "[ var='A' value=42 ]",
            "values": {"A": 42.0}
        }))
        .unwrap();

        assert_eq!(alert.status, AlertStatus::Resolved);
        assert_eq!(alert.fingerprint.as_deref(), Some("abcdef"));
        assert_eq!(alert.silence_url.as_deref(), Some("http://grafana/silence"));
        assert!(alert.values.is_some());
        assert_ne!(alert.ends_at, open_sentinel());
    }

    #[test]
    fn wire_alert_defaults_missing_fields() {
        let alert: WireAlert = serde_json::from_value(json!({
            "labels": {"alertname": "Bare"}
        }))
        .unwrap();

        assert_eq!(alert.status, AlertStatus::Firing);
        assert_eq!(alert.starts_at, open_sentinel());
        assert!(alert.generator_url.is_empty());
    }

    #[test]
    fn envelope_keeps_raw_alert_entries() {
        let envelope: ProducerEnvelope = serde_json::from_value(json!({
            "version": "4",
            "groupKey": "{}:{alertname=\"HighCPU\"}",
            "receiver": "team-x",
            "commonLabels": {"job": "node"},
            "alerts": [{"labels": {"alertname": "HighCPU"}}, "garbage"]
        }))
        .unwrap();

        assert_eq!(envelope.version.as_deref(), Some("4"));
        assert_eq!(envelope.receiver.as_deref(), Some("team-x"));
        assert_eq!(envelope.alerts.len(), 2);
    }

    #[test]
    fn status_round_trips_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertStatus::Firing).unwrap(),
            "\"firing\""
        );
        let status: AlertStatus = serde_json::from_str("\"resolved\"").unwrap();
        assert_eq!(status, AlertStatus::Resolved);
        assert_eq!(status.to_string(), "resolved");
    }
}
