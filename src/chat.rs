//! Bot-style chat delivery: photo with caption when a graph is available,
//! plain message otherwise.
//!
//! Messages are sent with `parse_mode=HTML`. The chat platform rejects
//! malformed markup with an HTTP 400 carrying a "can't parse entities"
//! description; such a send is retried exactly once without `parse_mode`,
//! downgrading `sendPhoto` to `sendMessage` along the way. A 400 complaining
//! about the photo itself downgrades to `sendMessage` with the original
//! text. Any further failure is terminal and reported with the platform's
//! description preserved.

use crate::prelude::*;

use crate::channels::{Channel, ChannelKind};

use reqwest::multipart::{Form, Part};
use thiserror::Error;
use unicode_ellipsis::truncate_str;

/// Chat platform limit for message text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;
/// Chat platform limit for photo captions, in characters.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Chat delivery failures.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat api returned {status}: {description}")]
    Api { status: u16, description: String },
    #[error("channel is not a chat channel")]
    NotAChatChannel,
}

/// Response envelope of the bot API.
#[allow(missing_docs)]
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Classified 400 responses driving the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFailure {
    /// The HTML markup did not parse; retry once without `parse_mode`.
    ParseEntities,
    /// The photo was rejected; deliver the text instead.
    BadPhoto,
    /// Anything else is terminal.
    Other,
}

/// Map a failed API response onto the fallback taxonomy.
#[must_use]
pub fn classify_failure(status: u16, description: &str) -> ApiFailure {
    if status != 400 {
        return ApiFailure::Other;
    }
    let lowered = description.to_lowercase();
    if lowered.contains("can't parse entities") || lowered.contains("unsupported start tag") {
        return ApiFailure::ParseEntities;
    }
    if lowered.contains("photo")
        || lowered.contains("image_process_failed")
        || lowered.contains("wrong file identifier")
    {
        return ApiFailure::BadPhoto;
    }
    ApiFailure::Other
}

/// Outcome detail of a successful delivery.
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    /// Set when the delivery needed the single fallback attempt.
    pub note: Option<&'static str>,
}

/// Truncate to the platform limit, marking the cut with `…`.
#[must_use]
pub fn clip(text: &str, max_chars: usize) -> String {
    truncate_str(text, max_chars).into_owned()
}

struct ApiResult {
    status: u16,
    ok: bool,
    description: String,
}

impl ApiResult {
    fn failure(&self) -> ApiFailure {
        classify_failure(self.status, &self.description)
    }
}

/// Deliver one rendered message (and optional graph) to a chat channel.
pub async fn send(
    client: &reqwest::Client,
    channel: &Channel,
    text: &str,
    image: Option<&[u8]>,
) -> Result<SendReport, ChatError> {
    let ChannelKind::Chat {
        bot_token,
        chat_id,
        api_base,
    } = &channel.kind
    else {
        return Err(ChatError::NotAChatChannel);
    };

    let timeout = Duration::from_secs(channel.timeout_seconds);
    let endpoint = Endpoint {
        client,
        base: api_base,
        token: bot_token,
        chat_id,
        timeout,
    };

    let photo_first = image.is_some();
    let first = match image {
        Some(bytes) => {
            endpoint
                .send_photo(bytes, &clip(text, MAX_CAPTION_CHARS), Some("HTML"))
                .await?
        }
        None => {
            endpoint
                .send_message(&clip(text, MAX_MESSAGE_CHARS), Some("HTML"))
                .await?
        }
    };

    if first.ok {
        return Ok(SendReport::default());
    }

    match first.failure() {
        ApiFailure::ParseEntities => {
            // one retry, markup stripped of special meaning; a photo attempt
            // downgrades to a plain message carrying the caption
            let retry = endpoint
                .send_message(&clip(text, MAX_MESSAGE_CHARS), None)
                .await?;
            if retry.ok {
                return Ok(SendReport {
                    note: Some("html-fallback"),
                });
            }
            Err(ChatError::Api {
                status: retry.status,
                description: retry.description,
            })
        }
        ApiFailure::BadPhoto if photo_first => {
            let retry = endpoint
                .send_message(&clip(text, MAX_MESSAGE_CHARS), Some("HTML"))
                .await?;
            if retry.ok {
                return Ok(SendReport {
                    note: Some("photo-fallback"),
                });
            }
            Err(ChatError::Api {
                status: retry.status,
                description: retry.description,
            })
        }
        _ => Err(ChatError::Api {
            status: first.status,
            description: first.description,
        }),
    }
}

struct Endpoint<'a> {
    client: &'a reqwest::Client,
    base: &'a str,
    token: &'a str,
    chat_id: &'a str,
    timeout: Duration,
}

impl Endpoint<'_> {
    async fn send_photo(
        &self,
        bytes: &[u8],
        caption: &str,
        parse_mode: Option<&str>,
    ) -> Result<ApiResult, ChatError> {
        let photo = Part::bytes(bytes.to_vec())
            .file_name("graph.png")
            .mime_str(mime::IMAGE_PNG.as_ref())?;
        let mut form = Form::new()
            .text("chat_id", self.chat_id.s())
            .text("caption", caption.s())
            .part("photo", photo);
        if let Some(mode) = parse_mode {
            form = form.text("parse_mode", mode.s());
        }

        let response = self
            .client
            .post(format!("{}/bot{}/sendPhoto", self.base, self.token))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::read_result(response).await
    }

    async fn send_message(
        &self,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<ApiResult, ChatError> {
        let mut body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = mode.into();
        }

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.base, self.token))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::read_result(response).await
    }

    async fn read_result(response: reqwest::Response) -> Result<ApiResult, ChatError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let decoded: ApiResponse = serde_json::from_str(&body).unwrap_or(ApiResponse {
            ok: status.is_success(),
            description: None,
        });

        Ok(ApiResult {
            status: status.as_u16(),
            ok: status.is_success() && decoded.ok,
            description: decoded.description.unwrap_or_else(|| status.s()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_parse_entity_errors() {
        assert_eq!(
            classify_failure(400, "Bad Request: can't parse entities: Unexpected end tag"),
            ApiFailure::ParseEntities
        );
        assert_eq!(
            classify_failure(400, "Bad Request: unsupported start tag \"notatag\""),
            ApiFailure::ParseEntities
        );
    }

    #[test]
    fn classifies_photo_errors() {
        assert_eq!(
            classify_failure(400, "Bad Request: PHOTO_INVALID_DIMENSIONS"),
            ApiFailure::BadPhoto
        );
        assert_eq!(
            classify_failure(400, "Bad Request: IMAGE_PROCESS_FAILED"),
            ApiFailure::BadPhoto
        );
        assert_eq!(
            classify_failure(400, "Bad Request: wrong file identifier/HTTP URL specified"),
            ApiFailure::BadPhoto
        );
    }

    #[test]
    fn other_failures_are_terminal() {
        assert_eq!(classify_failure(400, "Bad Request: chat not found"), ApiFailure::Other);
        assert_eq!(classify_failure(403, "Forbidden: bot was blocked"), ApiFailure::Other);
        assert_eq!(
            classify_failure(500, "can't parse entities"),
            ApiFailure::Other
        );
    }

    #[test]
    fn clip_respects_limits_and_marks_the_cut() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 100);
        let clipped = clip(&long, MAX_MESSAGE_CHARS);
        assert!(clipped.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(clipped.ends_with('…'));

        assert_eq!(clip("short", MAX_CAPTION_CHARS), "short");
    }

    #[test]
    fn clip_is_multibyte_safe() {
        let text = "告警".repeat(800);
        let clipped = clip(&text, MAX_CAPTION_CHARS);
        assert!(clipped.chars().count() <= MAX_CAPTION_CHARS);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn api_response_decodes() {
        let response: ApiResponse =
            serde_json::from_str(r#"{"ok":false,"error_code":400,"description":"Bad Request"}"#)
                .unwrap();
        assert!(!response.ok);
        assert_eq!(response.description.as_deref(), Some("Bad Request"));
    }
}
