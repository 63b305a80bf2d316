//! W3C WebDriver client (chromedriver) implementing [`Browser`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Browser, BrowserLauncher, ElementRef, Locator, TabId};
use crate::error::{BrowserError, ConfigError};

/// Key of a web element reference in WebDriver JSON.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Suffixes of in-progress downloads.
const PARTIAL_SUFFIXES: [&str; 3] = [".crdownload", ".part", ".tmp"];

const DOWNLOAD_POLL: Duration = Duration::from_millis(250);

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Base URL of the WebDriver server.
    pub url: String,
    pub headless: bool,
    /// Parent directory for per-session download directories.
    pub download_dir: PathBuf,
    /// Upper bound for a single WebDriver command.
    pub command_timeout: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9515".to_string(),
            headless: true,
            download_dir: std::env::temp_dir().join("dividend-relay-downloads"),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl WebDriverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let headless = match std::env::var("BROWSER_HEADLESS") {
            Ok(v) => parse_bool(&v).ok_or_else(|| ConfigError::InvalidValue {
                key: "BROWSER_HEADLESS".into(),
                message: format!("expected true/false, got '{v}'"),
            })?,
            Err(_) => defaults.headless,
        };

        Ok(Self {
            url: std::env::var("WEBDRIVER_URL").unwrap_or(defaults.url),
            headless,
            download_dir: std::env::var("BROWSER_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            command_timeout: defaults.command_timeout,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ── Launcher ────────────────────────────────────────────────────────

/// Starts a fresh WebDriver session (and download directory) per run.
pub struct WebDriverLauncher {
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, BrowserError> {
        let browser = WebDriverBrowser::start(&self.config).await?;
        Ok(Arc::new(browser))
    }
}

// ── Browser ─────────────────────────────────────────────────────────

pub struct WebDriverBrowser {
    client: reqwest::Client,
    /// `{server}/session/{id}`
    session_url: String,
    download_dir: PathBuf,
}

impl WebDriverBrowser {
    /// Create a new session on the WebDriver server.
    pub async fn start(config: &WebDriverConfig) -> Result<Self, BrowserError> {
        let download_dir = config.download_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&download_dir).await?;

        let client = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .build()
            .map_err(|e| BrowserError::Transport(e.to_string()))?;

        let server = config.url.trim_end_matches('/');
        let resp = client
            .post(format!("{server}/session"))
            .json(&capabilities(config.headless, &download_dir))
            .send()
            .await
            .map_err(|e| BrowserError::Transport(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrowserError::Transport(e.to_string()))?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(protocol_error(&value));
        }

        let session_id = value["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::Protocol {
                error: "session not created".into(),
                message: "response carried no sessionId".into(),
            })?;

        info!(session_id, headless = config.headless, "WebDriver session started");

        Ok(Self {
            client,
            session_url: format!("{server}/session/{session_id}"),
            download_dir,
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        let url = format!("{}{}", self.session_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BrowserError::Transport(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrowserError::Transport(e.to_string()))?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(protocol_error(&value));
        }
        Ok(value)
    }

    async fn element_bool(&self, element: &ElementRef, property: &str) -> Result<bool, BrowserError> {
        let value = self
            .call(Method::GET, &format!("/element/{}/{property}", element.0), None)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        self.call(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "Navigating");
        self.call(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.call(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_text(&self) -> Result<String, BrowserError> {
        let value = self
            .execute("return document.body ? document.body.innerText : '';", vec![])
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find(&self, locator: &Locator) -> Result<Option<ElementRef>, BrowserError> {
        let (using, value) = locator_query(locator);
        match self
            .call(
                Method::POST,
                "/element",
                Some(json!({ "using": using, "value": value })),
            )
            .await
        {
            Ok(v) => Ok(v[ELEMENT_KEY].as_str().map(|id| ElementRef(id.to_string()))),
            Err(BrowserError::Protocol { error, .. }) if error == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        self.element_bool(element, "displayed").await
    }

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        self.element_bool(element, "enabled").await
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        self.element_bool(element, "selected").await
    }

    async fn text(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let value = self
            .call(Method::GET, &format!("/element/{}/text", element.0), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn fill(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError> {
        self.call(
            Method::POST,
            &format!("/element/{}/clear", element.0),
            Some(json!({})),
        )
        .await?;
        self.call(
            Method::POST,
            &format!("/element/{}/value", element.0),
            Some(json!({ "text": value })),
        )
        .await?;
        Ok(())
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError> {
        self.execute(
            "arguments[0].value = arguments[1];\
             arguments[0].dispatchEvent(new Event('input', { bubbles: true }));\
             arguments[0].dispatchEvent(new Event('change', { bubbles: true }));",
            vec![json!({ ELEMENT_KEY: element.0 }), json!(value)],
        )
        .await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), BrowserError> {
        self.call(
            Method::POST,
            &format!("/element/{}/click", element.0),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    async fn download(
        &self,
        element: &ElementRef,
        timeout: Duration,
    ) -> Result<PathBuf, BrowserError> {
        let before = list_files(&self.download_dir).await?;
        self.click(element).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = list_files(&self.download_dir).await?;
            if let Some(path) = completed_download(&self.download_dir, &before, &now) {
                info!(path = %path.display(), "Download completed");
                return Ok(path);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::DownloadTimeout(timeout));
            }
            tokio::time::sleep(DOWNLOAD_POLL).await;
        }
    }

    async fn current_tab(&self) -> Result<TabId, BrowserError> {
        let value = self.call(Method::GET, "/window", None).await?;
        Ok(TabId(value.as_str().unwrap_or_default().to_string()))
    }

    async fn open_tab(&self, url: &str) -> Result<TabId, BrowserError> {
        let value = self
            .call(Method::POST, "/window/new", Some(json!({ "type": "tab" })))
            .await?;
        let handle = value["handle"]
            .as_str()
            .ok_or_else(|| BrowserError::Protocol {
                error: "unknown error".into(),
                message: "new window response carried no handle".into(),
            })?;
        let tab = TabId(handle.to_string());
        self.switch_to(&tab).await?;
        self.goto(url).await?;
        Ok(tab)
    }

    async fn switch_to(&self, tab: &TabId) -> Result<(), BrowserError> {
        self.call(Method::POST, "/window", Some(json!({ "handle": tab.0 })))
            .await?;
        Ok(())
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), BrowserError> {
        self.switch_to(tab).await?;
        self.call(Method::DELETE, "/window", None).await?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        let result = self.call(Method::DELETE, "", None).await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.download_dir).await {
            warn!(error = %e, "Failed to remove download directory");
        }
        result.map(|_| ())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn capabilities(headless: bool, download_dir: &Path) -> Value {
    let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage", "--lang=ja-JP"];
    if headless {
        args.push("--headless=new");
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": {
                    "args": args,
                    "prefs": {
                        "download.default_directory": download_dir.to_string_lossy(),
                        "download.prompt_for_download": false,
                        "download.directory_upgrade": true,
                    }
                }
            }
        }
    })
}

fn locator_query(locator: &Locator) -> (&'static str, String) {
    match locator {
        Locator::Css(s) => ("css selector", s.clone()),
        Locator::XPath(s) => ("xpath", s.clone()),
        Locator::LinkText(s) => ("partial link text", s.clone()),
        Locator::ButtonText(s) => {
            let lit = xpath_literal(s);
            (
                "xpath",
                format!(
                    "//button[contains(normalize-space(.), {lit})] \
                     | //input[(@type='submit' or @type='button') and contains(@value, {lit})] \
                     | //a[contains(normalize-space(.), {lit})]"
                ),
            )
        }
    }
}

/// Quote a string as an XPath literal.
fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        format!("'{s}'")
    } else if !s.contains('"') {
        format!("\"{s}\"")
    } else {
        let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

fn protocol_error(value: &Value) -> BrowserError {
    let error = value["error"].as_str().unwrap_or("unknown error").to_string();
    let message = value["message"].as_str().unwrap_or_default().to_string();
    match error.as_str() {
        "stale element reference" => BrowserError::StaleElement(message),
        "no such window" => BrowserError::UnknownTab(message),
        _ => BrowserError::Protocol { error, message },
    }
}

async fn list_files(dir: &Path) -> Result<HashSet<String>, BrowserError> {
    let mut names = HashSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// A file that appeared since `before` and is not a partial download.
/// Nothing is returned while any partial file is still present.
fn completed_download(dir: &Path, before: &HashSet<String>, now: &HashSet<String>) -> Option<PathBuf> {
    let is_partial = |name: &str| PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s));
    if now.iter().any(|n| is_partial(n)) {
        return None;
    }
    let mut fresh: Vec<&String> = now.difference(before).collect();
    fresh.sort();
    fresh.first().map(|name| dir.join(name.as_str()))
}
