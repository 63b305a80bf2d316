//! Notification payloads and the delivery capability.

pub mod formatter;
pub mod line;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

pub use formatter::{Formatter, NotificationPayload, Page};
pub use line::LineMessenger;

/// A message ready for a chat push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Plain text.
    Text { text: String },
    /// A rendered card (single bubble or carousel) with a preview string.
    Flex {
        alt_text: String,
        contents: serde_json::Value,
    },
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Flex { .. } => "flex",
        }
    }
}

/// One-way "deliver message" capability.
///
/// Each call performs at most one push; retries are the caller's decision.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Channel name (e.g. "line").
    fn name(&self) -> &str;

    /// Push `message` to `recipient`.
    async fn deliver(&self, recipient: &str, message: &OutboundMessage)
    -> Result<(), DeliveryError>;
}
