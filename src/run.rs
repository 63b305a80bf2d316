//! Run coordinator: sequences one trigger from login to delivery and folds
//! every result into a single [`RunOutcome`].
//!
//! A run owns its browser session from launch to teardown. The session is
//! quit on every path, including failures inside authentication.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::browser::{Browser, BrowserLauncher};
use crate::config::{ChallengeMailConfig, Config, DateDefaults, SessionTiming};
use crate::error::{ConfigError, DeliveryError, Error};
use crate::export::{DateRange, ExportOutcome, ExportRetrieval};
use crate::mail::correlator::CorrelatorConfig;
use crate::mail::payload::PayloadPatterns;
use crate::mail::{MailCorrelator, Mailbox};
use crate::notify::formatter::{self, DEFAULT_PAGE_SIZE};
use crate::notify::{Deliver, Formatter, NotificationPayload, OutboundMessage};
use crate::records::{self, ParsedExport};
use crate::session::{Credentials, SessionOrchestrator};

/// Title of the card sent when a run fails.
const ERROR_TITLE: &str = "配当金取得エラー";

/// Error notifications get one retry; success payloads get none.
const ERROR_DELIVERY_ATTEMPTS: u32 = 2;

/// How far a run goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Authenticate, export, parse, and deliver.
    #[default]
    Full,
    /// Stop once the session is ready.
    AuthOnly,
}

/// What a trigger asks for. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub from: Option<String>,
    pub to: Option<String>,
    pub mode: RunMode,
    /// Log the rendering instead of pushing it.
    pub dry_run: bool,
}

/// Result data of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunData {
    pub from: String,
    pub to: String,
    pub mode: RunMode,
    pub record_count: usize,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<NotificationPayload>,
}

/// Exactly one of these per run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { data: RunData },
    NoAction { message: String },
    Error { error: String, kind: String },
}

impl RunOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NoAction { .. } => "no_action",
            Self::Error { .. } => "error",
        }
    }
}

/// Something that can execute a run. The HTTP surface depends on this
/// rather than on [`RunCoordinator`] directly.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, request: RunRequest) -> RunOutcome;

    /// Push a fixed test card to the configured recipient.
    async fn send_test_notification(&self) -> Result<(), DeliveryError>;
}

/// Inputs of a run that do not change between triggers.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub login_url: String,
    pub dividends_url: String,
    pub utc_offset: FixedOffset,
    pub credentials: Credentials,
    pub challenge: ChallengeMailConfig,
    pub dates: DateDefaults,
    pub timing: SessionTiming,
    pub page_size: usize,
    pub recipient: String,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            login_url: config.portal.login_url.clone(),
            dividends_url: config.portal.dividends_url.clone(),
            utc_offset: config.portal.utc_offset,
            credentials: Credentials {
                user_id: config.portal.user_id.clone(),
                password: config.portal.password.clone(),
            },
            challenge: config.challenge.clone(),
            dates: config.dates.clone(),
            timing: config.timing,
            page_size: DEFAULT_PAGE_SIZE,
            recipient: config.line.user_id.clone(),
        }
    }
}

/// What the browser part of a run produced.
enum Collected {
    AuthOnly,
    NoData,
    Records(ParsedExport),
}

pub struct RunCoordinator {
    launcher: Arc<dyn BrowserLauncher>,
    mailbox: Arc<dyn Mailbox>,
    deliverer: Arc<dyn Deliver>,
    correlator: CorrelatorConfig,
    export: ExportRetrieval,
    formatter: Formatter,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        mailbox: Arc<dyn Mailbox>,
        deliverer: Arc<dyn Deliver>,
        settings: RunSettings,
    ) -> Result<Self, ConfigError> {
        let patterns = PayloadPatterns::new(&settings.challenge.link_domain).map_err(|e| {
            ConfigError::InvalidValue {
                key: "CHALLENGE_LINK_DOMAIN".into(),
                message: e.to_string(),
            }
        })?;
        let skew = chrono::Duration::from_std(settings.timing.clock_skew).map_err(|e| {
            ConfigError::InvalidValue {
                key: "MAIL_CLOCK_SKEW_SECS".into(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            launcher,
            mailbox,
            deliverer,
            correlator: CorrelatorConfig {
                sender: settings.challenge.sender.clone(),
                subject: settings.challenge.subject.clone(),
                skew,
                patterns,
            },
            export: ExportRetrieval::new(settings.dividends_url.clone(), &settings.timing),
            formatter: Formatter::new(settings.page_size),
            settings,
        })
    }

    async fn execute(&self, request: RunRequest) -> RunOutcome {
        let today = DateRange::today_in(self.settings.utc_offset, Utc::now());
        let range = match DateRange::resolve(
            request.from.as_deref(),
            request.to.as_deref(),
            &self.settings.dates,
            today,
        ) {
            Ok(range) => range,
            Err(e) => return self.fail(e.into(), request.dry_run).await,
        };
        info!(range = %range, "Run started");

        match self.collect(&range, request.mode).await {
            Ok(Collected::AuthOnly) => {
                info!("Session ready; skipping export");
                RunOutcome::Success {
                    data: RunData {
                        from: range.start(),
                        to: range.end(),
                        mode: RunMode::AuthOnly,
                        record_count: 0,
                        delivered: false,
                        payload: None,
                    },
                }
            }
            Ok(Collected::NoData) => self.report_no_data(&range, request.dry_run).await,
            Ok(Collected::Records(parsed)) if parsed.records.is_empty() => {
                self.report_no_data(&range, request.dry_run).await
            }
            Ok(Collected::Records(parsed)) => self.report(&range, parsed, request.dry_run).await,
            Err(e) => self.fail(e, request.dry_run).await,
        }
    }

    /// Launch a browser, drive it, and tear it down whatever happened.
    async fn collect(&self, range: &DateRange, mode: RunMode) -> Result<Collected, Error> {
        let browser = self.launcher.launch().await?;
        let teardown = Teardown(Some(Arc::clone(&browser)));
        let result = self.drive(browser, range, mode).await;
        teardown.finish().await;
        result
    }

    async fn drive(
        &self,
        browser: Arc<dyn Browser>,
        range: &DateRange,
        mode: RunMode,
    ) -> Result<Collected, Error> {
        let correlator = MailCorrelator::new(Arc::clone(&self.mailbox), self.correlator.clone());
        let mut orchestrator = SessionOrchestrator::new(
            browser,
            correlator,
            self.settings.login_url.clone(),
            self.settings.timing,
        );
        let session = orchestrator.authenticate(&self.settings.credentials).await?;

        if mode == RunMode::AuthOnly {
            return Ok(Collected::AuthOnly);
        }

        match self.export.fetch_export(&session, range).await? {
            ExportOutcome::NoData => Ok(Collected::NoData),
            ExportOutcome::Table(raw) => {
                let text = raw.decode()?;
                Ok(Collected::Records(records::parse(&text)))
            }
        }
    }

    async fn report(&self, range: &DateRange, parsed: ParsedExport, dry_run: bool) -> RunOutcome {
        let payload = self.formatter.format(&parsed.summary, &parsed.records);
        info!(
            records = payload.record_count(),
            pages = payload.pages.len(),
            "Notification prepared"
        );

        let delivered = if dry_run {
            info!(preview = %formatter::to_text(&payload), "Dry run; notification not sent");
            false
        } else {
            let message = formatter::to_message(&payload);
            if let Err(e) = self.deliverer.deliver(&self.settings.recipient, &message).await {
                return self.fail(e.into(), dry_run).await;
            }
            info!(channel = self.deliverer.name(), kind = message.label(), "Notification delivered");
            true
        };

        RunOutcome::Success {
            data: RunData {
                from: range.start(),
                to: range.end(),
                mode: RunMode::Full,
                record_count: payload.record_count(),
                delivered,
                payload: Some(payload),
            },
        }
    }

    async fn report_no_data(&self, range: &DateRange, dry_run: bool) -> RunOutcome {
        let message = format!("{range} の期間に該当する配当金はありません");
        info!(range = %range, "No dividends in range");

        if !dry_run {
            let card = formatter::text_card(formatter::TITLE, &message);
            if let Err(e) = self.deliverer.deliver(&self.settings.recipient, &card).await {
                warn!(error = %e, "No-data notification failed");
            }
        }
        RunOutcome::NoAction { message }
    }

    async fn fail(&self, err: Error, dry_run: bool) -> RunOutcome {
        let kind = err.kind();
        error!(kind, error = %err, "Run failed");
        if !dry_run {
            self.notify_error(&err).await;
        }
        RunOutcome::Error {
            error: err.to_string(),
            kind: kind.to_string(),
        }
    }

    async fn notify_error(&self, err: &Error) {
        let notice =
            OutboundMessage::text(format!("🚨 {ERROR_TITLE}\n配当金の取得に失敗しました\n{err}"));
        for attempt in 1..=ERROR_DELIVERY_ATTEMPTS {
            match self.deliverer.deliver(&self.settings.recipient, &notice).await {
                Ok(()) => return,
                Err(e) => warn!(attempt, error = %e, "Error notification failed"),
            }
        }
    }
}

/// Quits the browser when a run ends, including when the run future is
/// dropped before it completes.
struct Teardown(Option<Arc<dyn Browser>>);

impl Teardown {
    async fn finish(mut self) {
        if let Some(browser) = self.0.take() {
            quit(browser).await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let Some(browser) = self.0.take() else {
            return;
        };
        warn!("Run abandoned mid-flight; quitting browser in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(quit(browser));
            }
            Err(_) => warn!("No runtime left to quit the browser"),
        }
    }
}

async fn quit(browser: Arc<dyn Browser>) {
    if let Err(e) = browser.quit().await {
        warn!(error = %e, "Browser teardown failed");
    }
}

#[async_trait]
impl Runner for RunCoordinator {
    async fn run(&self, request: RunRequest) -> RunOutcome {
        let span = info_span!("run", run_id = %Uuid::new_v4(), mode = ?request.mode);
        self.execute(request).instrument(span).await
    }

    async fn send_test_notification(&self) -> Result<(), DeliveryError> {
        let card = formatter::text_card("テスト通知", "dividend-relay からのテストメッセージです");
        self.deliverer.deliver(&self.settings.recipient, &card).await
    }
}
