//! Mail correlator: finds the challenge email triggered by this run.
//!
//! The mailbox also receives unrelated traffic and older challenge mails,
//! and the portal's subject line changes between releases. Lookups are
//! scoped to messages arriving at or after the trigger instant (minus a
//! clock-skew tolerance) and broaden the search filter step by step when
//! the precise filter finds nothing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::payload::{self, ChallengePayload, PayloadPatterns};
use super::{MailMessage, Mailbox, SearchFilter};
use crate::error::MailError;

/// Maximum candidates fetched per poll.
const MAX_CANDIDATES: usize = 20;

/// The instant the portal was asked to send a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChallengeTrigger {
    at: DateTime<Utc>,
}

impl ChallengeTrigger {
    /// Record a trigger at the current instant.
    pub fn now() -> Self {
        Self { at: Utc::now() }
    }

    /// Record a trigger at a past instant. Future instants are clamped to now.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at: at.min(Utc::now()),
        }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.at
    }
}

/// A correlated challenge email and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeEmail {
    pub id: String,
    pub arrived_at: DateTime<Utc>,
    pub payload: ChallengePayload,
}

/// Correlator settings.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Sender address of challenge mails.
    pub sender: String,
    /// Subject text of challenge mails.
    pub subject: String,
    /// Clock-skew tolerance between the mail server and this host.
    pub skew: Duration,
    pub patterns: PayloadPatterns,
}

/// Identifiers examined and rejected during one polling loop.
pub type ExcludeSet = HashSet<String>;

/// One search step. Candidates found by a filter that names the subject
/// are challenge mails: failing to read their payload is fatal. Broader
/// steps may catch unrelated mail, which is skipped instead.
struct SearchStep {
    label: &'static str,
    filter: SearchFilter,
    strict: bool,
}

/// Read-only correlator over a mailbox.
pub struct MailCorrelator {
    mailbox: Arc<dyn Mailbox>,
    config: CorrelatorConfig,
}

impl MailCorrelator {
    pub fn new(mailbox: Arc<dyn Mailbox>, config: CorrelatorConfig) -> Self {
        Self { mailbox, config }
    }

    /// Earliest arrival instant accepted for `trigger`.
    pub fn cutoff(&self, trigger: &ChallengeTrigger) -> DateTime<Utc> {
        trigger.instant() - self.config.skew
    }

    fn search_steps(&self, since: DateTime<Utc>) -> Vec<SearchStep> {
        let c = &self.config;
        vec![
            SearchStep {
                label: "sender+subject",
                filter: SearchFilter::recent(since)
                    .sender(&c.sender)
                    .subject(&c.subject),
                strict: true,
            },
            SearchStep {
                label: "subject",
                filter: SearchFilter::recent(since).subject(&c.subject),
                strict: true,
            },
            SearchStep {
                label: "sender",
                filter: SearchFilter::recent(since).sender(&c.sender),
                strict: false,
            },
            SearchStep {
                label: "recent",
                filter: SearchFilter::recent(since),
                strict: false,
            },
        ]
    }

    /// Look for the challenge payload for `trigger`.
    ///
    /// Returns `Ok(None)` when nothing eligible has arrived yet. Messages
    /// rejected here are added to `exclude` so later polls skip them.
    pub async fn find_challenge_payload(
        &self,
        trigger: &ChallengeTrigger,
        exclude: &mut ExcludeSet,
    ) -> Result<Option<ChallengeEmail>, MailError> {
        let cutoff = self.cutoff(trigger);

        for step in self.search_steps(cutoff) {
            let ids = self.mailbox.search(&step.filter).await?;
            if ids.is_empty() {
                debug!(filter = step.label, "No mail matched");
                continue;
            }
            debug!(filter = step.label, matched = ids.len(), "Mail search matched");
            return self.pick(ids, cutoff, step.strict, exclude).await;
        }

        Ok(None)
    }

    /// Fetch candidates, keep the eligible ones, newest first.
    async fn pick(
        &self,
        ids: Vec<String>,
        cutoff: DateTime<Utc>,
        strict: bool,
        exclude: &mut ExcludeSet,
    ) -> Result<Option<ChallengeEmail>, MailError> {
        let fresh: Vec<String> = ids
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .collect();
        let skip = fresh.len().saturating_sub(MAX_CANDIDATES);

        let mut eligible: Vec<MailMessage> = Vec::new();
        for id in fresh.into_iter().skip(skip) {
            let msg = self.mailbox.fetch(&id).await?;
            if msg.arrived_at < cutoff {
                debug!(message_id = %id, arrived_at = %msg.arrived_at, "Mail predates trigger");
                exclude.insert(id);
                continue;
            }
            eligible.push(msg);
        }

        eligible.sort_by(|a, b| b.arrived_at.cmp(&a.arrived_at));

        for msg in eligible {
            let extracted =
                payload::find_text_part(&msg.body).and_then(|p| payload::extract(p, &self.config.patterns));

            match extracted {
                Some(payload) => {
                    info!(
                        message_id = %msg.id,
                        arrived_at = %msg.arrived_at,
                        kind = payload_kind(&payload),
                        "Correlated challenge email"
                    );
                    return Ok(Some(ChallengeEmail {
                        id: msg.id,
                        arrived_at: msg.arrived_at,
                        payload,
                    }));
                }
                None if strict => {
                    return Err(MailError::PayloadExtraction { id: msg.id });
                }
                None => {
                    warn!(message_id = %msg.id, "Skipping unrelated mail without payload");
                    exclude.insert(msg.id);
                }
            }
        }

        Ok(None)
    }
}

fn payload_kind(payload: &ChallengePayload) -> &'static str {
    match payload {
        ChallengePayload::Code(_) => "code",
        ChallengePayload::Url(_) => "url",
    }
}
