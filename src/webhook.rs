//! Generic webhook delivery.
//!
//! The rendered template output is taken as the JSON body and POSTed to the
//! receiver as-is, with the channel timeout and no retries.

use crate::channels::{Channel, ChannelKind};

use std::time::Duration;

use thiserror::Error;

/// Webhook delivery failures.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("receiver returned status {0}")]
    Status(u16),
    #[error("channel is not a webhook channel")]
    NotAWebhookChannel,
}

/// POST the rendered body to the receiver. 2xx is success, anything else a
/// failure carrying the status code.
pub async fn send(
    client: &reqwest::Client,
    channel: &Channel,
    body: &str,
) -> Result<(), WebhookError> {
    let ChannelKind::Webhook { url } = &channel.kind else {
        return Err(WebhookError::NotAWebhookChannel);
    };

    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body.to_owned())
        .timeout(Duration::from_secs(channel.timeout_seconds))
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(WebhookError::Status(status.as_u16()))
    }
}
