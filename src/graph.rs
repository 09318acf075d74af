//! Trend-graph rendering for alerts.
//!
//! When an alert carries a `generatorURL` pointing at the query that fired
//! it, the gateway can re-execute that query against the metrics backend over
//! a lookback window and attach a rasterized chart to chat deliveries. The
//! pipeline is best-effort throughout: any failure degrades to text-only
//! delivery, never to a dropped alert.
//!
//! # Configuration
//!
//! ```toml
//! [prometheus_image]
//! enabled = true
//! prometheus_url = "http://prometheus:9090"
//! lookback_minutes = 30
//! step_seconds = 30
//! timeout_seconds = 10
//! max_series = 10
//! width = 800
//! height = 400
//!
//! [grafana_image]
//! enabled = false
//! ```

use crate::prelude::*;

use crate::alert::Alert;

use std::collections::BTreeMap;

use plotters::prelude::*;
use reqwest::Url;
use tempfile::Builder;
use thiserror::Error;
use time::OffsetDateTime;

/// First eight bytes of every PNG stream.
pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Shorter buffers cannot be a real chart and are discarded.
pub const MIN_IMAGE_BYTES: usize = 100;

/// Caller-side cap on the metrics backend response body.
const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

/// Per-producer image pipeline configuration.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Metrics backend base URL. When unset, the authority of the alert's
    /// `generatorURL` is queried instead.
    #[serde(default)]
    pub prometheus_url: Option<String>,
    #[serde(default = "lookback_minutes")]
    pub lookback_minutes: i64,
    #[serde(default = "step_seconds")]
    pub step_seconds: u64,
    #[serde(default = "timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "max_series")]
    pub max_series: usize,
    #[serde(default = "width")]
    pub width: u32,
    #[serde(default = "height")]
    pub height: u32,
}

fn lookback_minutes() -> i64 {
    30
}

fn step_seconds() -> u64 {
    30
}

fn timeout_seconds() -> u64 {
    10
}

fn max_series() -> usize {
    10
}

fn width() -> u32 {
    800
}

fn height() -> u32 {
    400
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_url: None,
            lookback_minutes: lookback_minutes(),
            step_seconds: step_seconds(),
            timeout_seconds: timeout_seconds(),
            max_series: max_series(),
            width: width(),
            height: height(),
        }
    }
}

/// Why a graph could not be produced. All variants are non-fatal.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("source url carries no query expression")]
    NoQuery,
    #[error("source url is not usable: {0}")]
    BadUrl(String),
    #[error("range query failed: {0}")]
    QueryFailed(String),
    #[error("range query timed out")]
    Timeout,
    #[error("metrics backend response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,
    #[error("rendered bytes are not a valid png")]
    InvalidImage,
    #[error("chart rendering failed: {0}")]
    Render(String),
}

impl GraphError {
    /// Stable label for the failure counter.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        use GraphError::*;
        match self {
            NoQuery => "no_query",
            BadUrl(_) => "bad_url",
            QueryFailed(_) => "query_failed",
            Timeout => "timeout",
            ResponseTooLarge => "response_too_large",
            InvalidImage => "invalid_image",
            Render(_) => "render",
        }
    }
}

/// One time series to draw: display name plus `(unix seconds, value)` points.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

/// Standard prometheus range-query response shape.
#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize)]
pub struct RangeResponse {
    pub status: String,
    #[serde(default)]
    pub data: RangeData,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RangeData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<RangeSeries>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

/// Pull the query expression(s) and the backend authority out of a
/// `generatorURL`.
///
/// Prometheus graph URLs carry `g<i>.expr` parameters (`g0.expr` first);
/// Grafana URLs carry a plain `expr`. Returns the URL origin (scheme and
/// authority) alongside the decoded expressions.
pub fn extract_queries(source: &str, generator_url: &str) -> Result<(String, Vec<String>), GraphError> {
    if generator_url.is_empty() {
        return Err(GraphError::BadUrl("empty".s()));
    }
    let url = Url::parse(generator_url).map_err(|e| GraphError::BadUrl(e.s()))?;
    if !url.has_host() {
        return Err(GraphError::BadUrl("no host".s()));
    }
    let origin = url.origin().ascii_serialization();

    let exprs = if source == "prometheus" {
        let mut indexed: Vec<(usize, String)> = vec![];
        for (key, value) in url.query_pairs() {
            let Some(index) = key
                .strip_prefix('g')
                .and_then(|k| k.strip_suffix(".expr"))
                .and_then(|i| i.parse::<usize>().ok())
            else {
                continue;
            };
            indexed.push((index, value.s()));
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, expr)| expr).collect()
    } else {
        url.query_pairs()
            .filter(|(key, _)| key == "expr")
            .map(|(_, value)| value.s())
            .collect::<Vec<String>>()
    };

    if exprs.is_empty() {
        return Err(GraphError::NoQuery);
    }
    Ok((origin, exprs))
}

/// Execute one range query over the lookback window.
pub async fn query_range(
    client: &reqwest::Client,
    base: &str,
    expr: &str,
    config: &ImageConfig,
) -> Result<Vec<Series>, GraphError> {
    let end = OffsetDateTime::now_utc().unix_timestamp();
    let start = end - config.lookback_minutes * 60;
    let url = format!("{}/api/v1/query_range", base.trim_end_matches('/'));

    let start = start.s();
    let end = end.s();
    let step = config.step_seconds.s();
    let response = client
        .get(url)
        .query(&[
            ("query", expr),
            ("start", start.as_str()),
            ("end", end.as_str()),
            ("step", step.as_str()),
        ])
        .timeout(Duration::from_secs(config.timeout_seconds))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GraphError::Timeout
            } else {
                GraphError::QueryFailed(e.s())
            }
        })?;

    if !response.status().is_success() {
        return Err(GraphError::QueryFailed(format!(
            "backend returned {}",
            response.status()
        )));
    }
    if response
        .content_length()
        .is_some_and(|length| length as usize > MAX_RESPONSE_BYTES)
    {
        return Err(GraphError::ResponseTooLarge);
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| GraphError::QueryFailed(e.s()))?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(GraphError::ResponseTooLarge);
    }

    let decoded: RangeResponse =
        serde_json::from_slice(&body).map_err(|e| GraphError::QueryFailed(e.s()))?;
    if decoded.status != "success" {
        return Err(GraphError::QueryFailed(format!(
            "backend status {}",
            decoded.status
        )));
    }

    Ok(decoded.data.result.into_iter().map(to_series).collect())
}

fn to_series(series: RangeSeries) -> Series {
    let name = if let Some(metric_name) = series.metric.get("__name__") {
        let rest: Vec<String> = series
            .metric
            .iter()
            .filter(|(key, _)| *key != "__name__")
            .map(|(key, value)| format!("{key}={value:?}"))
            .collect();
        if rest.is_empty() {
            metric_name.clone()
        } else {
            format!("{metric_name}{{{}}}", rest.join(","))
        }
    } else {
        let pairs: Vec<String> = series
            .metric
            .iter()
            .map(|(key, value)| format!("{key}={value:?}"))
            .collect();
        format!("{{{}}}", pairs.join(","))
    };

    let points = series
        .values
        .into_iter()
        .filter_map(|(ts, value)| {
            let value: f64 = value.parse().ok()?;
            value.is_finite().then_some((ts, value))
        })
        .collect();

    Series { name, points }
}

/// Render the collected series into PNG bytes.
///
/// Returns `Ok(None)` when there is nothing to draw. The chart goes through
/// a temporary file, is read back, and must pass [`is_valid_png`] before it
/// is handed to a sender.
pub fn render_png(series: &[Series], config: &ImageConfig) -> Result<Option<Vec<u8>>, GraphError> {
    let drawable: Vec<&Series> = series.iter().filter(|s| !s.points.is_empty()).collect();
    if drawable.is_empty() {
        return Ok(None);
    }

    let tempfile = Builder::new()
        .prefix("alerthub-graph-")
        .suffix(".png")
        .rand_bytes(5)
        .tempfile()
        .map_err(|e| GraphError::Render(e.s()))?;
    let path = tempfile
        .path()
        .to_str()
        .ok_or_else(|| GraphError::Render("tempfile path not utf-8".s()))?;

    draw(path, &drawable, config.width, config.height).map_err(|e| GraphError::Render(e.s()))?;

    let bytes = fs::read(path).map_err(|e| GraphError::Render(e.s()))?;
    if !is_valid_png(&bytes) {
        return Err(GraphError::InvalidImage);
    }
    Ok(Some(bytes))
}

/// The chart is deliberately text-free: no system font is needed, so the
/// renderer works in minimal containers.
fn draw(out_file: &str, series: &[&Series], width: u32, height: u32) -> anyhow::Result<()> {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for s in series {
        for (x, y) in &s.points {
            min_x = min_x.min(*x);
            max_x = max_x.max(*x);
            min_y = min_y.min(*y);
            max_y = max_y.max(*y);
        }
    }
    // widen degenerate ranges so a flat line still plots
    if (max_x - min_x).abs() < f64::EPSILON {
        max_x = min_x + 1.0;
    }
    if (max_y - min_y).abs() < f64::EPSILON {
        max_y = min_y + 1.0;
        min_y -= 1.0;
    }
    let y_pad = (max_y - min_y) * 0.05;

    let root = BitMapBackend::new(out_file, (width, height)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(12)
        .build_cartesian_2d(min_x..max_x, (min_y - y_pad)..(max_y + y_pad))?;

    chart
        .configure_mesh()
        .x_labels(0)
        .y_labels(0)
        .light_line_style(&RGBColor(235, 235, 235))
        .bold_line_style(&RGBColor(210, 210, 210))
        .draw()?;

    for (index, s) in series.iter().enumerate() {
        let color = Palette99::pick(index);
        chart.draw_series(LineSeries::new(s.points.iter().copied(), color.stroke_width(2)))?;
    }

    root.present()?;
    Ok(())
}

/// Accept only buffers that start with the PNG magic and are plausibly large
/// enough to be a chart.
#[must_use]
pub fn is_valid_png(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_IMAGE_BYTES && bytes[..PNG_MAGIC.len()] == PNG_MAGIC
}

/// Full pipeline for one alert: extract, query, draw, validate.
///
/// Returns `Ok(None)` when the producer returned no data points.
pub async fn alert_graph(
    client: &reqwest::Client,
    alert: &Alert,
    config: &ImageConfig,
) -> Result<Option<Vec<u8>>, GraphError> {
    let (origin, exprs) = extract_queries(alert.source(), &alert.generator_url)?;
    let base = config.prometheus_url.clone().unwrap_or(origin);

    let mut series: Vec<Series> = vec![];
    for expr in &exprs {
        series.extend(query_range(client, &base, expr, config).await?);
    }
    if series.len() > config.max_series {
        debug!(
            alertname = alert.name(),
            dropped = series.len() - config.max_series,
            "capping rendered series"
        );
        series.truncate(config.max_series);
    }

    render_png(&series, config)
}
