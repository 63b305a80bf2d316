//! LINE Messaging API push client.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use super::{Deliver, OutboundMessage};
use crate::error::DeliveryError;

/// Maximum characters in one LINE text message.
const LINE_MAX_TEXT_LENGTH: usize = 5000;

/// Maximum message objects in one push request.
const LINE_MAX_MESSAGES_PER_PUSH: usize = 5;

const DEFAULT_API_BASE: &str = "https://api.line.me";

/// Pushes messages to a LINE user through the Messaging API.
pub struct LineMessenger {
    access_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl LineMessenger {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another API host (used by tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn push_url(&self) -> String {
        format!("{}/v2/bot/message/push", self.api_base)
    }
}

#[async_trait]
impl Deliver for LineMessenger {
    fn name(&self) -> &str {
        "line"
    }

    async fn deliver(
        &self,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        if recipient.is_empty() {
            return Err(DeliveryError::NotConfigured("line".into()));
        }

        let body = json!({
            "to": recipient,
            "messages": line_messages(message),
        });

        let resp = self
            .client
            .post(self.push_url())
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                channel: "line".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                channel: "line".into(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(kind = message.label(), "LINE push delivered");
        Ok(())
    }
}

/// Convert an outbound message into LINE message objects.
///
/// Long text is split across several message objects of one push. Chunks
/// past the per-push cap are dropped with a warning.
fn line_messages(message: &OutboundMessage) -> Vec<Value> {
    match message {
        OutboundMessage::Text { text } => {
            let mut chunks = split_message(text, LINE_MAX_TEXT_LENGTH);
            if chunks.len() > LINE_MAX_MESSAGES_PER_PUSH {
                let dropped: usize = chunks[LINE_MAX_MESSAGES_PER_PUSH..]
                    .iter()
                    .map(|c| c.chars().count())
                    .sum();
                tracing::warn!(
                    chunks = chunks.len(),
                    dropped_chars = dropped,
                    "Text exceeds one LINE push; truncating"
                );
                chunks.truncate(LINE_MAX_MESSAGES_PER_PUSH);
            }
            chunks
                .into_iter()
                .map(|chunk| json!({ "type": "text", "text": chunk }))
                .collect()
        }
        OutboundMessage::Flex { alt_text, contents } => vec![json!({
            "type": "flex",
            "altText": alt_text,
            "contents": contents,
        })],
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring
/// newline then space boundaries.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the char limit
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
