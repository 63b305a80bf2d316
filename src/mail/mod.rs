//! Mailbox access and challenge-mail correlation.

pub mod correlator;
pub mod imap;
pub mod payload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

pub use correlator::{ChallengeEmail, ChallengeTrigger, CorrelatorConfig, MailCorrelator};
pub use imap::ImapMailbox;
pub use payload::ChallengePayload;

/// Search criteria understood by the mailbox backend.
///
/// `since` bounds the search coarsely (backends may round to whole days);
/// exact arrival filtering happens in the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub from: Option<String>,
    pub subject: Option<String>,
    pub since: DateTime<Utc>,
}

impl SearchFilter {
    pub fn recent(since: DateTime<Utc>) -> Self {
        Self {
            from: None,
            subject: None,
            since,
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.from = Some(sender.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// MIME body tree of a fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    /// `text/plain`
    Text(String),
    /// `text/html`
    Html(String),
    /// A container of sub-parts, in document order.
    Multipart(Vec<BodyPart>),
    /// Attachments, images, and anything else without readable text.
    Other,
}

/// A message as returned by the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Backend identifier (IMAP UID).
    pub id: String,
    /// Server arrival instant.
    pub arrived_at: DateTime<Utc>,
    pub body: BodyPart,
}

/// Read-only mailbox capability.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Return identifiers of messages matching `filter`, oldest first.
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<String>, MailError>;

    /// Fetch one message without changing its flags.
    async fn fetch(&self, id: &str) -> Result<MailMessage, MailError>;
}
