//! Message rendering from named templates.
//!
//! Channels reference templates by file name, resolved in the flat directory
//! configured as `templates_dir`. Rendering is Jinja2-compatible via
//! `minijinja` and deliberately lenient: unknown keys expand to the empty
//! string rather than failing a delivery.
//!
//! # Configuration
//!
//! ```toml
//! templates_dir = "./templates"
//! ```
//!
//! # Template context
//!
//! All canonical alert fields (`status`, `labels`, `annotations`,
//! `startsAt`, `endsAt`, `generatorURL`, …) plus:
//! * `status_text` - `告警` while firing, `恢复` once resolved
//! * `status_emoji` - marker for chat templates
//! * `startsAt_cst`, `endsAt_cst` - timestamps presented in UTC+8,
//!   `YYYY-MM-DD HH:MM:SS`; `endsAt_cst` is empty while the alert is open
//! * `merged_entities` - entities collapsed by the normalizer
//! * `has_image` - whether a trend graph will accompany the message
//! * `channel` - the delivery channel id
//!
//! The helper `url_to_link(s)` wraps plain URLs in HTML anchors.

use crate::prelude::*;

use crate::alert::Alert;

use minijinja::{Environment, UndefinedBehavior, path_loader};
use regex::Regex;
use thiserror::Error;
use time::macros::{format_description, offset};
use time::{OffsetDateTime, UtcOffset};

/// Presentation zone for rendered timestamps.
pub const CST: UtcOffset = offset!(+8);

/// Upper bound on a rendered message before truncation policies apply.
const MAX_RENDERED_BYTES: usize = 256 * 1024;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"']+"#).expect("static pattern")
});

static TIMESTAMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("static pattern")
});

/// Rendering failures; each skips one channel, never the whole alert.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {name:?} failed to load: {source}")]
    Load {
        name: String,
        source: minijinja::Error,
    },
    #[error("template {name:?} failed to render: {source}")]
    Render {
        name: String,
        source: minijinja::Error,
    },
    #[error("template {name:?} rendered more than {MAX_RENDERED_BYTES} bytes")]
    TooLarge { name: String },
}

/// Template environment over the configured directory.
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    /// Build the environment with the directory loader and helpers attached.
    #[must_use]
    pub fn new(templates_dir: &str) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(templates_dir));
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env.add_function("url_to_link", url_to_link);
        Self { env }
    }

    /// Render a named template against an alert.
    pub fn render(
        &self,
        name: &str,
        alert: &Alert,
        channel: &str,
        has_image: bool,
    ) -> Result<String, RenderError> {
        let template = self.env.get_template(name).map_err(|source| RenderError::Load {
            name: name.s(),
            source,
        })?;

        let context = context(alert, channel, has_image);
        let rendered = template
            .render(&context)
            .map_err(|source| RenderError::Render {
                name: name.s(),
                source,
            })?;

        if rendered.len() > MAX_RENDERED_BYTES {
            return Err(RenderError::TooLarge { name: name.s() });
        }
        Ok(rendered)
    }
}

/// Assemble the template context for one alert and channel.
#[must_use]
pub fn context(alert: &Alert, channel: &str, has_image: bool) -> minijinja::Value {
    let mut fields = match serde_json::to_value(alert) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };

    fields.insert("status_text".s(), status_text(alert).into());
    fields.insert("status_emoji".s(), alert.status.into_emoji().into());
    fields.insert("startsAt_cst".s(), format_cst(alert.starts_at).into());
    let ends_cst = if alert.is_open() {
        String::new()
    } else {
        format_cst(alert.ends_at)
    };
    fields.insert("endsAt_cst".s(), ends_cst.into());
    fields.insert(
        "merged_entities".s(),
        serde_json::Value::from(alert.merged_entities.clone()),
    );
    fields.insert("has_image".s(), has_image.into());
    fields.insert("channel".s(), channel.s().into());

    minijinja::Value::from_serialize(&fields)
}

/// `告警` while firing, `恢复` once resolved.
#[must_use]
pub fn status_text(alert: &Alert) -> &'static str {
    if alert.is_resolved() { "恢复" } else { "告警" }
}

/// Format an instant in the presentation zone as `YYYY-MM-DD HH:MM:SS`.
#[must_use]
pub fn format_cst(instant: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    instant.to_offset(CST).format(format).unwrap_or_default()
}

/// Wrap plain URLs in HTML anchors for chat clients.
#[must_use]
pub fn url_to_link(text: String) -> String {
    URL_PATTERN
        .replace_all(&text, |caps: &regex::Captures| {
            let url = &caps[0];
            format!("<a href=\"{url}\">{url}</a>")
        })
        .into_owned()
}

/// Rewrite RFC-3339 timestamp substrings into the CST presentation form.
///
/// Applied to webhook payloads after rendering, so producer timestamps that
/// templates copied verbatim still read in the presentation zone. Substrings
/// that fail to parse are left untouched.
#[must_use]
pub fn rewrite_timestamps(rendered: &str) -> String {
    use time::format_description::well_known::Rfc3339;

    TIMESTAMP_PATTERN
        .replace_all(rendered, |caps: &regex::Captures| {
            let original = &caps[0];
            let mut candidate = original.s();
            // naive timestamps are taken as UTC; colon-less offsets get one
            if !candidate.ends_with('Z') {
                match candidate.rfind(['+', '-']) {
                    Some(pos) if pos > 10 && !candidate[pos..].contains(':') => {
                        candidate.insert(candidate.len() - 2, ':');
                    }
                    Some(pos) if pos > 10 => {}
                    _ => candidate.push('Z'),
                }
            }
            match OffsetDateTime::parse(&candidate, &Rfc3339) {
                Ok(instant) => format_cst(instant),
                Err(_) => original.s(),
            }
        })
        .into_owned()
}
