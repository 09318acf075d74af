//! Turns producer webhook payloads into canonical [`Alert`] records.
//!
//! Identification looks at the decoded JSON value and picks one of the three
//! recognized shapes; parsing then promotes per-alert fields, merges the
//! envelope-level common labels and annotations under them, and stamps the
//! gateway labels `_source` and `_receiver`. A malformed per-alert entry is
//! logged and skipped; the envelope as a whole is rejected only when nothing
//! could be extracted.

use crate::prelude::*;

use crate::alert::{
    Alert, AlertStatus, LABEL_RECEIVER, LABEL_SOURCE, ProducerEnvelope, WireAlert, open_sentinel,
};

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

/// Labels identifying the entity an alert fired for. Alerts that differ only
/// in one of these collapse into a single record with `merged_entities` set.
pub const ENTITY_LABELS: [&str; 5] = ["pod", "instance", "service_name", "container", "host"];

/// Producer shapes the gateway recognizes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Prometheus,
    Grafana,
    /// The payload itself is one inline alert object.
    Single,
    Unknown,
}

/// Errors rejecting a whole envelope. Per-alert problems never surface here.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The payload matches none of the recognized envelope shapes.
    #[error("UnrecognizedPayload")]
    UnrecognizedPayload,
    /// The envelope was recognized but no alert entry survived parsing.
    #[error("no alerts could be extracted from the envelope")]
    NoAlerts,
}

/// Identify which producer sent the payload.
///
/// The rules are ordered; the first match wins. A numeric `orgId` or the
/// `version == "1"` marker identify Grafana, a versioned `groupKey` envelope
/// (or any envelope with an `alerts` array, leniently) identifies
/// Prometheus, and a bare object carrying `labels` and `status` is taken as
/// one inline alert.
#[must_use]
pub fn identify(payload: &Value) -> PayloadKind {
    use PayloadKind::*;

    let version = payload.get("version").and_then(Value::as_str);

    if payload.get("orgId").is_some_and(Value::is_number) {
        return Grafana;
    }
    if version == Some("1") && (payload.get("state").is_some() || payload.get("title").is_some()) {
        return Grafana;
    }
    if version.is_some_and(|v| v != "1")
        && payload.get("groupKey").is_some()
        && payload.get("alerts").is_some()
    {
        return Prometheus;
    }
    if payload.get("alerts").is_some() {
        return Prometheus;
    }
    if payload.get("labels").is_some() && payload.get("status").is_some() {
        return Single;
    }
    Unknown
}

/// Normalize a decoded webhook payload into canonical alerts, in envelope
/// order, with entity merging applied.
pub fn normalize(payload: &Value) -> Result<Vec<Alert>, NormalizeError> {
    use PayloadKind::*;

    let alerts = match identify(payload) {
        Prometheus => normalize_envelope(payload, "prometheus")?,
        Grafana => normalize_envelope(payload, "grafana")?,
        Single => {
            let wire: WireAlert = serde_json::from_value(payload.clone())
                .map_err(|_| NormalizeError::UnrecognizedPayload)?;
            vec![canonicalize(wire, "prometheus", None, &BTreeMap::new(), &BTreeMap::new())]
        }
        Unknown => return Err(NormalizeError::UnrecognizedPayload),
    };

    if alerts.is_empty() {
        return Err(NormalizeError::NoAlerts);
    }

    Ok(merge_entities(alerts))
}

fn normalize_envelope(payload: &Value, source: &str) -> Result<Vec<Alert>, NormalizeError> {
    let envelope: ProducerEnvelope = serde_json::from_value(payload.clone())
        .map_err(|_| NormalizeError::UnrecognizedPayload)?;

    let mut alerts: Vec<Alert> = Vec::with_capacity(envelope.alerts.len());

    for (idx, entry) in envelope.alerts.into_iter().enumerate() {
        let wire: WireAlert = match serde_json::from_value(entry) {
            Ok(w) => w,
            Err(e) => {
                warn!(source, index = idx, "skipping malformed alert entry: {e}");
                continue;
            }
        };
        alerts.push(canonicalize(
            wire,
            source,
            envelope.receiver.as_deref(),
            &envelope.common_labels,
            &envelope.common_annotations,
        ));
    }

    Ok(alerts)
}

/// Promote a wire alert into the canonical record.
///
/// Envelope-level common labels and annotations are merged underneath the
/// per-alert values (per-alert wins on conflict). Producer-supplied keys
/// starting with `_` are dropped before the gateway stamps its own.
fn canonicalize(
    wire: WireAlert,
    source: &str,
    receiver: Option<&str>,
    common_labels: &BTreeMap<String, String>,
    common_annotations: &BTreeMap<String, String>,
) -> Alert {
    let mut labels = common_labels.clone();
    labels.extend(wire.labels);
    labels.retain(|key, _| !key.starts_with('_'));
    labels.insert(LABEL_SOURCE.s(), source.s());
    if let Some(receiver) = receiver {
        labels.insert(LABEL_RECEIVER.s(), receiver.s());
    }

    let mut annotations = common_annotations.clone();
    annotations.extend(wire.annotations);

    // A resolved alert always carries a close time.
    let ends_at = if wire.status == AlertStatus::Resolved && wire.ends_at == open_sentinel() {
        OffsetDateTime::now_utc()
    } else {
        wire.ends_at
    };

    Alert {
        status: wire.status,
        labels,
        annotations,
        starts_at: wire.starts_at,
        ends_at,
        generator_url: wire.generator_url,
        fingerprint: wire.fingerprint,
        silence_url: wire.silence_url,
        dashboard_url: wire.dashboard_url,
        panel_url: wire.panel_url,
        values: wire.values,
        value_string: wire.value_string,
        merged_entities: vec![],
    }
}

/// Collapse alerts that differ only in one entity label.
///
/// First-seen ordering is preserved both for the surviving alerts and for the
/// values collected into `merged_entities`; the survivor keeps its own value
/// of the differing label so routing rules matching on it still see one.
#[must_use]
pub fn merge_entities(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut kept: Vec<Alert> = Vec::with_capacity(alerts.len());

    'next_alert: for alert in alerts {
        for existing in &mut kept {
            if existing.status != alert.status {
                continue;
            }
            let Some(entity) = mergeable_on(existing, &alert) else {
                continue;
            };
            let value = alert.labels.get(entity).cloned().unwrap_or_default();
            if existing.merged_entities.is_empty() {
                let first = existing.labels.get(entity).cloned().unwrap_or_default();
                existing.merged_entities.push(first);
            }
            if !existing.merged_entities.contains(&value) {
                existing.merged_entities.push(value);
            }
            continue 'next_alert;
        }
        kept.push(alert);
    }

    kept
}

/// The single entity label two alerts differ on, if they are collapsible.
fn mergeable_on(a: &Alert, b: &Alert) -> Option<&'static str> {
    if a.name().is_empty() || a.name() != b.name() || a.labels.len() != b.labels.len() {
        return None;
    }

    let mut differing: Option<&'static str> = None;
    for (key, value) in &a.labels {
        match b.labels.get(key) {
            None => return None,
            Some(other) if other == value => {}
            Some(_) => {
                let entity = ENTITY_LABELS.iter().find(|e| **e == key.as_str())?;
                if differing.is_some() {
                    return None;
                }
                differing = Some(entity);
            }
        }
    }
    differing
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prometheus_envelope() -> Value {
        json!({
            "version": "4",
            "groupKey": "{}:{alertname=\"HighCPU\"}",
            "status": "firing",
            "receiver": "team-infra",
            "commonLabels": {"job": "node", "severity": "warning"},
            "commonAnnotations": {"runbook": "https://wiki/runbook"},
            "externalURL": "http://alertmanager:9093",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "HighCPU", "severity": "critical", "_sneaky": "x"},
                "annotations": {"summary": "cpu is high"},
                "startsAt": "2024-01-15T10:30:00Z",
                "endsAt": "0001-01-01T00:00:00Z",
                "generatorURL": "http://prom:9090/graph?g0.expr=cpu"
            }]
        })
    }

    #[test]
    fn identifies_grafana_by_org_id() {
        let payload = json!({"orgId": 1, "alerts": [], "version": "1"});
        assert_eq!(identify(&payload), PayloadKind::Grafana);
    }

    #[test]
    fn identifies_grafana_by_version_one_with_title() {
        let payload = json!({"version": "1", "title": "[FIRING:1]", "alerts": []});
        assert_eq!(identify(&payload), PayloadKind::Grafana);
    }

    #[test]
    fn identifies_prometheus_by_versioned_group_key() {
        assert_eq!(identify(&prometheus_envelope()), PayloadKind::Prometheus);
    }

    #[test]
    fn identifies_bare_alerts_array_as_prometheus() {
        let payload = json!({"alerts": [{"labels": {"alertname": "X"}}]});
        assert_eq!(identify(&payload), PayloadKind::Prometheus);
    }

    #[test]
    fn identifies_single_inline_alert() {
        let payload = json!({"status": "firing", "labels": {"alertname": "X"}});
        assert_eq!(identify(&payload), PayloadKind::Single);
    }

    #[test]
    fn identifies_unknown() {
        assert_eq!(identify(&json!({"hello": "world"})), PayloadKind::Unknown);
        assert!(matches!(
            normalize(&json!({"hello": "world"})),
            Err(NormalizeError::UnrecognizedPayload)
        ));
    }

    #[test]
    fn prometheus_promotion_and_stamping() {
        let alerts = normalize(&prometheus_envelope()).unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];

        assert_eq!(alert.labels[LABEL_SOURCE], "prometheus");
        assert_eq!(alert.labels[LABEL_RECEIVER], "team-infra");
        // per-alert value wins over commonLabels
        assert_eq!(alert.labels["severity"], "critical");
        // commonLabels merged underneath
        assert_eq!(alert.labels["job"], "node");
        // commonAnnotations merged
        assert_eq!(alert.annotations["runbook"], "https://wiki/runbook");
        // producer may not set underscore keys
        assert!(!alert.labels.contains_key("_sneaky"));
        assert!(alert.is_open());
    }

    #[test]
    fn grafana_promotion_keeps_extras() {
        let payload = json!({
            "orgId": 1,
            "version": "1",
            "state": "alerting",
            "title": "[FIRING:1]",
            "receiver": "grafana-default",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "DiskFull"},
                "startsAt": "2024-01-15T10:30:00Z",
                "fingerprint": "deadbeef",
                "silenceURL": "http://grafana/silence",
                "panelURL": "http://grafana/panel",
                "valueString": "[ var='A' value=97 ]"
            }]
        });

        let alerts = normalize(&payload).unwrap();
        let alert = &alerts[0];
        assert_eq!(alert.labels[LABEL_SOURCE], "grafana");
        assert_eq!(alert.fingerprint.as_deref(), Some("deadbeef"));
        assert_eq!(alert.panel_url.as_deref(), Some("http://grafana/panel"));
        assert_eq!(alert.value_string.as_deref(), Some("[ var='A' value=97 ]"));
    }

    #[test]
    fn malformed_entry_skipped_siblings_kept() {
        let payload = json!({
            "version": "4",
            "groupKey": "k",
            "alerts": [
                {"labels": {"alertname": "Good"}},
                {"labels": "not-a-map"},
                {"labels": {"alertname": "AlsoGood"}}
            ]
        });

        let alerts = normalize(&payload).unwrap();
        let names: Vec<&str> = alerts.iter().map(Alert::name).collect();
        assert_eq!(names, vec!["Good", "AlsoGood"]);
    }

    #[test]
    fn envelope_with_no_surviving_alerts_fails() {
        let payload = json!({"version": "4", "groupKey": "k", "alerts": []});
        assert!(matches!(normalize(&payload), Err(NormalizeError::NoAlerts)));

        let payload = json!({"version": "4", "groupKey": "k", "alerts": [{"labels": 42}]});
        assert!(matches!(normalize(&payload), Err(NormalizeError::NoAlerts)));
    }

    #[test]
    fn resolved_alert_gets_close_time() {
        let payload = json!({
            "alerts": [{
                "status": "resolved",
                "labels": {"alertname": "X"},
                "startsAt": "2024-01-15T10:30:00Z"
            }]
        });

        let alerts = normalize(&payload).unwrap();
        assert!(alerts[0].is_resolved());
        assert!(!alerts[0].is_open());
    }

    #[test]
    fn merges_alerts_differing_in_one_entity_label() {
        let payload = json!({
            "alerts": [
                {"labels": {"alertname": "PodDown", "pod": "web-1", "ns": "prod"}},
                {"labels": {"alertname": "PodDown", "pod": "web-2", "ns": "prod"}},
                {"labels": {"alertname": "PodDown", "pod": "web-3", "ns": "prod"}}
            ]
        });

        let alerts = normalize(&payload).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].labels["pod"], "web-1");
        assert_eq!(alerts[0].merged_entities, vec!["web-1", "web-2", "web-3"]);
    }

    #[test]
    fn does_not_merge_across_non_entity_differences() {
        let payload = json!({
            "alerts": [
                {"labels": {"alertname": "PodDown", "pod": "web-1", "severity": "warning"}},
                {"labels": {"alertname": "PodDown", "pod": "web-2", "severity": "critical"}}
            ]
        });

        let alerts = normalize(&payload).unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].merged_entities.is_empty());
    }

    #[test]
    fn does_not_merge_across_status() {
        let payload = json!({
            "alerts": [
                {"status": "firing", "labels": {"alertname": "X", "instance": "a"},
                 "startsAt": "2024-01-15T10:30:00Z"},
                {"status": "resolved", "labels": {"alertname": "X", "instance": "b"},
                 "startsAt": "2024-01-15T10:30:00Z", "endsAt": "2024-01-15T10:35:00Z"}
            ]
        });

        assert_eq!(normalize(&payload).unwrap().len(), 2);
    }

    #[test]
    fn normalization_is_idempotent_over_canonical_shapes() {
        let first = normalize(&prometheus_envelope()).unwrap();
        let reserialized = json!({
            "receiver": "team-infra",
            "alerts": [serde_json::to_value(&first[0]).unwrap()]
        });
        let second = normalize(&reserialized).unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].labels, second[0].labels);
        assert_eq!(first[0].annotations, second[0].annotations);
        assert_eq!(first[0].status, second[0].status);
        assert_eq!(first[0].starts_at, second[0].starts_at);
    }
}
