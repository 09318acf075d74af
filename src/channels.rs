//! Delivery channel configuration and per-channel policy.
//!
//! Channels are loaded once at startup and read-only afterwards;
//! configuration changes take effect by restarting the process.
//!
//! # Configuration
//!
//! ```toml
//! [channels.chat_default]
//! type = "chat"
//! bot_token = "123456:secret"
//! chat_id = "-1001234"
//! template = "chat_default.tmpl"
//! image_enabled = true
//!
//! [channels.audit]
//! type = "webhook"
//! url = "https://receiver.internal/alerts"
//! template = "webhook.tmpl"
//! send_resolved = false
//! proxy = "socks5://127.0.0.1:1080"
//! proxy_enabled = true
//! ```

use crate::prelude::*;

use crate::alert::Alert;

/// Endpoint-specific channel half, discriminated by `type`.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelKind {
    /// Bot-style photo/message API.
    Chat {
        bot_token: String,
        chat_id: String,
        #[serde(default = "api_base")]
        api_base: String,
    },
    /// Generic JSON POST receiver.
    Webhook { url: String },
}

fn api_base() -> String {
    "https://api.telegram.org".s()
}

/// One configured delivery endpoint with its policy flags.
#[allow(missing_docs)]
#[derive(Clone, Debug, Deserialize)]
pub struct Channel {
    #[serde(flatten)]
    pub kind: ChannelKind,
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Template file name, resolved in `templates_dir`.
    pub template: String,
    #[serde(default)]
    pub image_enabled: bool,
    #[serde(default = "send_resolved")]
    pub send_resolved: bool,
    /// Channel-local proxy URL, used when `proxy_enabled` is set.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default = "timeout_seconds")]
    pub timeout_seconds: u64,
}

fn enabled() -> bool {
    true
}

fn send_resolved() -> bool {
    true
}

fn timeout_seconds() -> u64 {
    10
}

/// Why the policy filter dropped a channel for an alert.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    ResolvedSuppressed,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::ResolvedSuppressed => "send_resolved=false",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

impl Channel {
    /// Apply the delivery policy for one alert.
    ///
    /// Image availability never drops a channel: chat deliveries always fall
    /// back to text.
    pub fn eligible(&self, alert: &Alert) -> Result<(), SkipReason> {
        if !self.enabled {
            return Err(SkipReason::Disabled);
        }
        if alert.is_resolved() && !self.send_resolved {
            return Err(SkipReason::ResolvedSuppressed);
        }
        Ok(())
    }

    /// Whether the endpoint type can carry an image at all.
    #[must_use]
    pub const fn supports_images(&self) -> bool {
        matches!(self.kind, ChannelKind::Chat { .. })
    }

    /// Whether this channel asks for a trend graph.
    #[must_use]
    pub const fn wants_image(&self) -> bool {
        self.image_enabled && self.supports_images()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertStatus, open_sentinel};
    use std::collections::BTreeMap;

    fn alert(status: AlertStatus) -> Alert {
        Alert {
            status,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: open_sentinel(),
            ends_at: open_sentinel(),
            generator_url: String::new(),
            fingerprint: None,
            silence_url: None,
            dashboard_url: None,
            panel_url: None,
            values: None,
            value_string: None,
            merged_entities: vec![],
        }
    }

    fn chat_channel() -> Channel {
        toml::from_str(
            r#"
            type = "chat"
            bot_token = "123456:secret"
            chat_id = "-1001234"
            template = "chat.tmpl"
            image_enabled = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn chat_channel_decodes_with_defaults() {
        let channel = chat_channel();
        assert!(channel.enabled);
        assert!(channel.send_resolved);
        assert!(!channel.proxy_enabled);
        assert_eq!(channel.timeout_seconds, 10);
        match &channel.kind {
            ChannelKind::Chat { api_base, chat_id, .. } => {
                assert_eq!(api_base, "https://api.telegram.org");
                assert_eq!(chat_id, "-1001234");
            }
            ChannelKind::Webhook { .. } => panic!("wrong kind"),
        }
    }

    #[test]
    fn webhook_channel_decodes() {
        let channel: Channel = toml::from_str(
            r#"
            type = "webhook"
            url = "https://receiver.internal/alerts"
            template = "webhook.tmpl"
            enabled = false
            send_resolved = false
            "#,
        )
        .unwrap();

        assert!(!channel.enabled);
        assert!(!channel.send_resolved);
        assert!(matches!(channel.kind, ChannelKind::Webhook { .. }));
    }

    #[test]
    fn disabled_channel_is_skipped() {
        let mut channel = chat_channel();
        channel.enabled = false;
        assert_eq!(
            channel.eligible(&alert(AlertStatus::Firing)),
            Err(SkipReason::Disabled)
        );
    }

    #[test]
    fn resolved_suppression() {
        let mut channel = chat_channel();
        channel.send_resolved = false;

        assert!(channel.eligible(&alert(AlertStatus::Firing)).is_ok());
        let skip = channel.eligible(&alert(AlertStatus::Resolved)).unwrap_err();
        assert_eq!(skip, SkipReason::ResolvedSuppressed);
        assert_eq!(skip.as_str(), "send_resolved=false");
    }

    #[test]
    fn image_capability_is_chat_only() {
        assert!(chat_channel().wants_image());

        let webhook: Channel = toml::from_str(
            r#"
            type = "webhook"
            url = "http://x"
            template = "t"
            image_enabled = true
            "#,
        )
        .unwrap();
        assert!(!webhook.wants_image());
    }
}
