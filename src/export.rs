//! Export retrieval: downloads the dividend CSV for a date range from an
//! authenticated session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use encoding_rs::Encoding;
use tracing::{debug, info, warn};

use crate::browser::{Backoff, Browser, LocatorChain, Resolved};
use crate::config::{DateDefaults, SessionTiming};
use crate::error::{BrowserError, ExportError};
use crate::session::{AuthenticatedSession, selectors};

/// Date format used by triggers, configuration, and the portal.
pub const DATE_FORMAT: &str = "%Y/%m/%d";

/// Encoding assumed for the portal's CSV export.
pub const DEFAULT_ENCODING: &str = "Shift_JIS";

/// An inclusive settlement-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Resolve each end independently: explicit value, else configured
    /// default, else `today`.
    pub fn resolve(
        from: Option<&str>,
        to: Option<&str>,
        defaults: &DateDefaults,
        today: NaiveDate,
    ) -> Result<Self, ExportError> {
        let pick = |explicit: Option<&str>, default: Option<&String>| -> Result<NaiveDate, ExportError> {
            match explicit
                .filter(|s| !s.trim().is_empty())
                .or(default.map(String::as_str))
            {
                Some(value) => parse_date(value),
                None => Ok(today),
            }
        };

        let range = Self {
            from: pick(from, defaults.from.as_ref())?,
            to: pick(to, defaults.to.as_ref())?,
        };
        if range.from > range.to {
            return Err(ExportError::InvertedRange {
                from: range.start(),
                to: range.end(),
            });
        }
        Ok(range)
    }

    /// The calendar date at `now` in the portal's time zone.
    pub fn today_in(offset: FixedOffset, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&offset).date_naive()
    }

    pub fn start(&self) -> String {
        self.from.format(DATE_FORMAT).to_string()
    }

    pub fn end(&self) -> String {
        self.to.format(DATE_FORMAT).to_string()
    }

    /// The dividend view URL for this range.
    pub fn view_url(&self, base: &str) -> Result<String, ExportError> {
        let url = reqwest::Url::parse_with_params(
            base,
            &[
                ("dispositionDateFrom", self.start()),
                ("dispositionDateTo", self.end()),
                ("period", "CUSTOM".to_string()),
            ],
        )
        .map_err(|e| ExportError::Download(format!("invalid dividends URL: {e}")))?;
        Ok(url.into())
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start(), self.end())
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ExportError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| ExportError::InvalidDate {
        value: value.to_string(),
    })
}

/// Downloaded export bytes and their declared or assumed encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub bytes: Vec<u8>,
    pub encoding: String,
}

impl RawTable {
    /// Decode to text. A byte-order mark overrides the declared encoding.
    pub fn decode(&self) -> Result<String, ExportError> {
        let declared = Encoding::for_label(self.encoding.as_bytes()).ok_or_else(|| {
            ExportError::Decode {
                encoding: self.encoding.clone(),
            }
        })?;
        let (text, used, had_errors) = declared.decode(&self.bytes);
        if had_errors {
            warn!(encoding = used.name(), "Export contained undecodable bytes");
        }
        Ok(text.into_owned())
    }
}

/// Result of an export request. An empty range is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Table(RawTable),
    NoData,
}

/// Removes the downloaded file when dropped.
struct DownloadGuard {
    path: PathBuf,
}

impl DownloadGuard {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed downloaded export"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove downloaded export"),
        }
    }
}

pub struct ExportRetrieval {
    dividends_url: String,
    backoff: Backoff,
    download_timeout: Duration,
}

impl ExportRetrieval {
    pub fn new(dividends_url: impl Into<String>, timing: &SessionTiming) -> Self {
        Self {
            dividends_url: dividends_url.into(),
            backoff: timing.backoff,
            download_timeout: timing.download_timeout,
        }
    }

    /// Open the dividend view for `range` and download its CSV.
    pub async fn fetch_export(
        &self,
        session: &AuthenticatedSession,
        range: &DateRange,
    ) -> Result<ExportOutcome, ExportError> {
        let browser = session.browser();
        browser.switch_to(session.primary_tab()).await?;

        let url = range.view_url(&self.dividends_url)?;
        info!(range = %range, "Opening dividend view");
        browser.goto(&url).await?;

        let chain = selectors::csv_download();
        let Some(control) = self.await_view(browser, &chain).await? else {
            info!(range = %range, "Dividend view reports no rows");
            return Ok(ExportOutcome::NoData);
        };

        let path = browser
            .download(&control.element, self.download_timeout)
            .await
            .map_err(|e| match e {
                BrowserError::DownloadTimeout(d) => {
                    ExportError::Download(format!("no file completed within {d:?}"))
                }
                other => ExportError::Browser(other),
            })?;
        let guard = DownloadGuard { path };

        let bytes = tokio::fs::read(guard.path())
            .await
            .map_err(|e| ExportError::Download(format!("{}: {e}", guard.path().display())))?;
        if bytes.is_empty() {
            return Err(ExportError::Download("downloaded file is empty".into()));
        }

        info!(bytes = bytes.len(), "Export downloaded");
        Ok(ExportOutcome::Table(RawTable {
            bytes,
            encoding: DEFAULT_ENCODING.to_string(),
        }))
    }

    /// Wait until the view shows either the no-results marker (`None`)
    /// or the CSV control.
    async fn await_view(
        &self,
        browser: &dyn Browser,
        chain: &LocatorChain,
    ) -> Result<Option<Resolved>, ExportError> {
        for attempt in 0..self.backoff.max_attempts {
            let text = browser.page_text().await?;
            if selectors::NO_RESULTS_MARKERS.iter().any(|m| text.contains(m)) {
                return Ok(None);
            }
            if let Some(control) = chain.sweep(browser).await? {
                debug!(strategy = control.strategy, attempt, "CSV control found");
                return Ok(Some(control));
            }
            if attempt + 1 < self.backoff.max_attempts {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }
        }
        Err(ExportError::UiElementNotFound(chain.control().to_string()))
    }
}
