//! Browser automation capability.
//!
//! The session and export code drive the portal through [`Browser`] and
//! never talk to a specific engine. [`webdriver::WebDriverBrowser`] is the
//! production implementation.

pub mod resolve;
pub mod webdriver;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrowserError;

pub use resolve::{Backoff, LocatorChain, Predicate, Resolved, Strategy};
pub use webdriver::{WebDriverBrowser, WebDriverLauncher};

/// How an element is located on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// CSS selector.
    Css(String),
    /// XPath expression.
    XPath(String),
    /// Anchor whose visible text contains the given string.
    LinkText(String),
    /// Button-like control (button, submit input, anchor) whose label
    /// contains the given string.
    ButtonText(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Self::XPath(expr.into())
    }

    pub fn link_text(text: impl Into<String>) -> Self {
        Self::LinkText(text.into())
    }

    pub fn button_text(text: impl Into<String>) -> Self {
        Self::ButtonText(text.into())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={s}"),
            Self::XPath(s) => write!(f, "xpath={s}"),
            Self::LinkText(s) => write!(f, "link={s}"),
            Self::ButtonText(s) => write!(f, "button={s}"),
        }
    }
}

/// A browser tab (window handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabId(pub String);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an element found in the current tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

/// The capability the session and export code need from a browser engine.
///
/// All element operations apply to the current tab. Implementations
/// bound every individual call; waiting and retrying is done by callers.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigate the current tab and wait for the document to load.
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Visible text of the current document body.
    async fn page_text(&self) -> Result<String, BrowserError>;

    /// Find the first element matching `locator`, if any.
    async fn find(&self, locator: &Locator) -> Result<Option<ElementRef>, BrowserError>;

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, BrowserError>;

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, BrowserError>;

    /// Checked state of a checkbox or radio input.
    async fn is_selected(&self, element: &ElementRef) -> Result<bool, BrowserError>;

    async fn text(&self, element: &ElementRef) -> Result<String, BrowserError>;

    /// Clear a field and type `value` into it.
    async fn fill(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError>;

    /// Assign a field's value by script and fire input/change events.
    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError>;

    async fn click(&self, element: &ElementRef) -> Result<(), BrowserError>;

    /// Activate `element` and wait for the download it starts to complete.
    /// Returns the path of the downloaded file.
    async fn download(
        &self,
        element: &ElementRef,
        timeout: Duration,
    ) -> Result<PathBuf, BrowserError>;

    async fn current_tab(&self) -> Result<TabId, BrowserError>;

    /// Open a new tab at `url` and make it current.
    async fn open_tab(&self, url: &str) -> Result<TabId, BrowserError>;

    async fn switch_to(&self, tab: &TabId) -> Result<(), BrowserError>;

    /// Close `tab`. The current tab is undefined afterwards; callers switch
    /// explicitly.
    async fn close_tab(&self, tab: &TabId) -> Result<(), BrowserError>;

    /// End the browser session and release the engine.
    async fn quit(&self) -> Result<(), BrowserError>;
}

/// Starts one browser session per run.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>, BrowserError>;
}
