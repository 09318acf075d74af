//! The alert service: everything between a decoded webhook payload and the
//! per-channel delivery outcomes.
//!
//! For each envelope: normalize, then per alert (in envelope order) run the
//! dedup window, the routing table, the channel policy filter, the
//! trend-graph pipeline (at most once per alert), and finally the template
//! and sender for every eligible channel. Channel sends run concurrently and
//! are joined before the response is assembled; a failure is always local to
//! one alert and one channel.

use crate::prelude::*;

use crate::alert::Alert;
use crate::channels::{Channel, ChannelKind};
use crate::chat;
use crate::dedup::{Admission, DedupCache};
use crate::graph::{self, ImageConfig};
use crate::metrics::{ALERTS_RECEIVED, DEDUP_SUPPRESSED, GRAPH_FAILURES, SENDS};
use crate::normalizer::{self, NormalizeError};
use crate::render::{self, Renderer};
use crate::routing::Router;
use crate::webhook;

use futures::future::join_all;
use serde_json::Value;

/// Outcome of one delivery attempt (or policy skip), as reported to the
/// webhook caller.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub alert: String,
    pub channel: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Aggregated response for one envelope.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Default)]
pub struct EnvelopeOutcome {
    pub results: Vec<DeliveryResult>,
}

/// Currently-firing alerts, tracked per producer for the `/alerts` endpoint.
#[derive(Default)]
struct FiringAlerts {
    inner: Mutex<HashMap<String, Vec<Alert>>>,
}

impl FiringAlerts {
    fn fire(&self, alert: &Alert) -> anyhow::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(e) => bail!("failed locking firing alerts map: {e}"),
        };

        let entry = inner.entry(alert.source().s()).or_default();
        let fingerprint = DedupCache::fingerprint(alert);
        if !entry
            .iter()
            .any(|known| DedupCache::fingerprint(known) == fingerprint)
        {
            entry.push(alert.clone());
        }
        Ok(())
    }

    fn resolve(&self, alert: &Alert) -> anyhow::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(e) => bail!("failed locking firing alerts map: {e}"),
        };

        let fingerprint = DedupCache::fingerprint(alert);
        inner
            .entry(alert.source().s())
            .and_modify(|known| known.retain(|a| DedupCache::fingerprint(a) != fingerprint));
        Ok(())
    }

    fn snapshot(&self) -> HashMap<String, Vec<Alert>> {
        match self.inner.lock() {
            Ok(inner) => inner.clone(),
            Err(_) => HashMap::new(),
        }
    }
}

/// Orchestrator built once from configuration and shared across requests.
pub struct AlertService {
    channels: HashMap<String, Channel>,
    router: Router,
    dedup: DedupCache,
    renderer: Renderer,
    prometheus_image: ImageConfig,
    grafana_image: ImageConfig,
    proxy: Option<String>,
    proxy_enabled: bool,
    firing: FiringAlerts,
}

impl AlertService {
    /// Build the service from validated configuration.
    ///
    /// # Errors
    /// Will return error when the routing table or dedup pattern fail to
    /// compile; configuration load has already validated both, so this only
    /// fires for hand-built configs.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            channels: config.channels.clone(),
            router: Router::compile(&config.routing)?,
            dedup: DedupCache::new(&config.jenkins_dedup)?,
            renderer: Renderer::new(&config.templates_dir),
            prometheus_image: config.prometheus_image.clone(),
            grafana_image: config.grafana_image.clone(),
            proxy: config.proxy.clone(),
            proxy_enabled: config.proxy_enabled,
            firing: FiringAlerts::default(),
        })
    }

    /// Handle one decoded webhook payload.
    ///
    /// # Errors
    /// Will return error only when the envelope itself is unusable; all
    /// per-alert and per-channel failures are reported in the outcome.
    pub async fn process(&self, payload: &Value) -> Result<EnvelopeOutcome, NormalizeError> {
        let alerts = normalizer::normalize(payload)?;

        let mut results: Vec<DeliveryResult> = vec![];
        for alert in alerts {
            ALERTS_RECEIVED.with_label_values(&[alert.source()]).inc();
            self.process_alert(&alert, &mut results).await;
        }
        Ok(EnvelopeOutcome { results })
    }

    /// Currently-firing alerts per producer.
    #[must_use]
    pub fn firing_alerts(&self) -> HashMap<String, Vec<Alert>> {
        self.firing.snapshot()
    }

    async fn process_alert(&self, alert: &Alert, results: &mut Vec<DeliveryResult>) {
        let deduped = self.dedup.applies(alert);
        let fingerprint = DedupCache::fingerprint(alert);

        if deduped && !alert.is_resolved() {
            match self.dedup.admit(&fingerprint) {
                Ok(Admission::Admitted) => {}
                Ok(Admission::Suppressed) => {
                    info!(
                        alertname = alert.name(),
                        fingerprint, dedup_hit = true, "suppressing duplicate build alert"
                    );
                    DEDUP_SUPPRESSED.inc();
                    return;
                }
                Err(e) => error!("dedup admission failed, forwarding alert: {e}"),
            }
        }

        let registry_update = if alert.is_resolved() {
            self.firing.resolve(alert)
        } else {
            self.firing.fire(alert)
        };
        if let Err(e) = registry_update {
            error!("failed updating firing alert registry: {e}");
        }

        let routed = self.router.route(alert);
        if routed.is_empty() {
            info!(alertname = alert.name(), source = alert.source(), "unrouted");
        } else {
            let mut eligible: Vec<(String, &Channel)> = vec![];
            for id in routed {
                let Some(channel) = self.channels.get(&id) else {
                    warn!(channel = id, "routed to unconfigured channel");
                    continue;
                };
                match channel.eligible(alert) {
                    Ok(()) => eligible.push((id, channel)),
                    Err(skip) => {
                        info!(
                            alertname = alert.name(),
                            channel = id,
                            reason = skip.as_str(),
                            "suppressed by channel policy"
                        );
                        SENDS.with_label_values(&[id.as_str(), "skipped"]).inc();
                        results.push(DeliveryResult {
                            alert: alert.name().s(),
                            channel: id,
                            ok: false,
                            reason: Some(skip.as_str().s()),
                            note: None,
                        });
                    }
                }
            }

            let image = if eligible.iter().any(|(_, channel)| channel.wants_image()) {
                self.graph_for(alert).await
            } else {
                None
            };

            let sends = eligible
                .into_iter()
                .map(|(id, channel)| self.deliver(alert, id, channel, image.as_deref()));
            results.extend(join_all(sends).await);
        }

        if deduped && alert.is_resolved() {
            if let Err(e) = self.dedup.forget(&fingerprint) {
                error!("failed clearing dedup entry: {e}");
            }
        }
    }

    /// Compute the trend graph at most once per alert.
    async fn graph_for(&self, alert: &Alert) -> Option<Vec<u8>> {
        let config = match alert.source() {
            "prometheus" => &self.prometheus_image,
            "grafana" => &self.grafana_image,
            _ => return None,
        };
        if !config.enabled {
            return None;
        }

        match graph::alert_graph(&crate::tools::shared_client(), alert, config).await {
            Ok(image) => image,
            Err(e) => {
                info!(
                    alertname = alert.name(),
                    reason = e.reason(),
                    "trend graph unavailable, delivering text-only: {e}"
                );
                GRAPH_FAILURES.with_label_values(&[e.reason()]).inc();
                None
            }
        }
    }

    async fn deliver(
        &self,
        alert: &Alert,
        id: String,
        channel: &Channel,
        image: Option<&[u8]>,
    ) -> DeliveryResult {
        let image = if channel.wants_image() { image } else { None };

        let rendered = match self
            .renderer
            .render(&channel.template, alert, &id, image.is_some())
        {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(alertname = alert.name(), channel = id, "skipping channel: {e}");
                SENDS.with_label_values(&[id.as_str(), "template_error"]).inc();
                return DeliveryResult {
                    alert: alert.name().s(),
                    channel: id,
                    ok: false,
                    reason: Some(e.s()),
                    note: None,
                };
            }
        };

        let client = match crate::tools::client_for(channel, self.proxy.as_deref(), self.proxy_enabled)
        {
            Ok(client) => client,
            Err(e) => {
                error!(channel = id, "no usable http client: {e}");
                SENDS.with_label_values(&[id.as_str(), "failed"]).inc();
                return DeliveryResult {
                    alert: alert.name().s(),
                    channel: id,
                    ok: false,
                    reason: Some(e.s()),
                    note: None,
                };
            }
        };

        let (ok, reason, note) = match &channel.kind {
            ChannelKind::Chat { .. } => match chat::send(&client, channel, &rendered, image).await {
                Ok(report) => (true, None, report.note.map(|n| n.s())),
                Err(e) => (false, Some(e.s()), None),
            },
            ChannelKind::Webhook { .. } => {
                let body = render::rewrite_timestamps(&rendered);
                match webhook::send(&client, channel, &body).await {
                    Ok(()) => (true, None, None),
                    Err(e) => (false, Some(e.s()), None),
                }
            }
        };

        let outcome = if ok { "ok" } else { "failed" };
        SENDS.with_label_values(&[id.as_str(), outcome]).inc();
        if ok {
            info!(alertname = alert.name(), channel = id, note, "delivered");
        } else {
            error!(
                alertname = alert.name(),
                channel = id,
                description = reason.as_deref().unwrap_or(""),
                "delivery failed"
            );
        }

        DeliveryResult {
            alert: alert.name().s(),
            channel: id,
            ok,
            reason,
            note,
        }
    }
}
