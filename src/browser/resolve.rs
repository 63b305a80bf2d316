//! Locator chains: resolve a UI control through an ordered list of
//! strategies with bounded, incrementally backed-off polling.
//!
//! The portal's markup drifts between releases, so each control is
//! described by several strategies. One *attempt* sweeps all strategies in
//! order and accepts the first whose predicate holds; attempts are capped
//! so a permanently broken selector fails deterministically.

use std::time::Duration;

use tracing::debug;

use super::{Browser, ElementRef, Locator};
use crate::error::BrowserError;

/// Condition an element must satisfy for a strategy to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Attached to the document.
    Present,
    /// Attached and displayed.
    Visible,
    /// Displayed and enabled.
    Interactive,
}

/// One way of locating a control.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub name: &'static str,
    pub locator: Locator,
    pub predicate: Predicate,
}

/// A control that has been resolved, and the strategy that found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub element: ElementRef,
    pub strategy: &'static str,
}

/// Polling schedule for UI waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            increment: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay after the zero-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        (self.initial + self.increment * attempt).min(self.max_delay)
    }
}

/// Ordered strategies for one named control.
#[derive(Debug, Clone)]
pub struct LocatorChain {
    control: &'static str,
    strategies: Vec<Strategy>,
}

impl LocatorChain {
    pub fn new(control: &'static str) -> Self {
        Self {
            control,
            strategies: Vec::new(),
        }
    }

    /// Append a strategy. Earlier strategies are preferred.
    pub fn then(mut self, name: &'static str, locator: Locator, predicate: Predicate) -> Self {
        self.strategies.push(Strategy {
            name,
            locator,
            predicate,
        });
        self
    }

    pub fn control(&self) -> &'static str {
        self.control
    }

    #[cfg(test)]
    pub(crate) fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub(crate) fn len(&self) -> usize {
        self.strategies.len()
    }

    /// One sweep over all strategies, without waiting.
    pub async fn sweep(&self, browser: &dyn Browser) -> Result<Option<Resolved>, BrowserError> {
        for strategy in &self.strategies {
            let Some(element) = browser.find(&strategy.locator).await? else {
                continue;
            };
            match satisfies(browser, &element, strategy.predicate).await {
                Ok(true) => {
                    return Ok(Some(Resolved {
                        element,
                        strategy: strategy.name,
                    }));
                }
                Ok(false) | Err(BrowserError::StaleElement(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Sweep until a strategy resolves or `backoff.max_attempts` sweeps
    /// have failed. `None` means the chain is exhausted.
    pub async fn resolve(
        &self,
        browser: &dyn Browser,
        backoff: &Backoff,
    ) -> Result<Option<Resolved>, BrowserError> {
        for attempt in 0..backoff.max_attempts {
            if let Some(resolved) = self.sweep(browser).await? {
                debug!(
                    control = self.control,
                    strategy = resolved.strategy,
                    attempt,
                    "Resolved control"
                );
                return Ok(Some(resolved));
            }
            if attempt + 1 < backoff.max_attempts {
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }
        debug!(control = self.control, tried = self.len(), "Locator chain exhausted");
        Ok(None)
    }
}

async fn satisfies(
    browser: &dyn Browser,
    element: &ElementRef,
    predicate: Predicate,
) -> Result<bool, BrowserError> {
    match predicate {
        Predicate::Present => Ok(true),
        Predicate::Visible => browser.is_displayed(element).await,
        Predicate::Interactive => {
            Ok(browser.is_displayed(element).await? && browser.is_enabled(element).await?)
        }
    }
}

/// Poll the page text until one of `markers` appears. Returns the marker
/// found, or `None` once attempts are exhausted.
pub async fn wait_for_text(
    browser: &dyn Browser,
    markers: &[&'static str],
    backoff: &Backoff,
) -> Result<Option<&'static str>, BrowserError> {
    for attempt in 0..backoff.max_attempts {
        let text = browser.page_text().await?;
        if let Some(marker) = markers.iter().copied().find(|m| text.contains(m)) {
            return Ok(Some(marker));
        }
        if attempt + 1 < backoff.max_attempts {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }
    Ok(None)
}
