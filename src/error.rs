//! Error types for the dividend relay.

use std::time::Duration;

/// Top-level error type for a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl Error {
    /// Short machine-readable kind, used in run outcomes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Session(e) => e.kind(),
            Self::Export(ExportError::Download(_) | ExportError::UiElementNotFound(_)) => "download",
            Self::Export(_) => "export",
            Self::Mail(MailError::PayloadExtraction { .. }) => "payload_extraction",
            Self::Mail(_) => "mail",
            Self::Browser(_) => "browser",
            Self::Delivery(_) => "delivery",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Browser automation capability errors.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("WebDriver request failed: {0}")]
    Transport(String),

    #[error("WebDriver returned {error}: {message}")]
    Protocol { error: String, message: String },

    #[error("Element reference is no longer attached: {0}")]
    StaleElement(String),

    #[error("Unknown tab: {0}")]
    UnknownTab(String),

    #[error("No download completed within {0:?}")]
    DownloadTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox access and challenge-mail errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mailbox connection failed: {0}")]
    Connection(String),

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox login rejected for {username}")]
    LoginRejected { username: String },

    #[error("Could not parse message {id}")]
    UnparseableMessage { id: String },

    #[error("Challenge email {id} matched but no code or link was found in its body")]
    PayloadExtraction { id: String },

    #[error("Mailbox task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the authentication state machine.
///
/// Every variant is fatal for the current run.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Portal rejected the credentials: {0}")]
    Auth(String),

    #[error("No locator strategy resolved control '{control}' ({tried} strategies tried)")]
    UiElementNotFound { control: String, tried: usize },

    #[error("No challenge email correlated within {0:?}")]
    ChallengeTimeout(Duration),

    #[error("Challenge email {id} could not be read: no payload pattern matched")]
    PayloadExtraction { id: String },

    #[error("Authenticated landing state not reached: {0}")]
    PostAuthVerification(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Mail error: {0}")]
    Mail(MailError),
}

impl From<MailError> for SessionError {
    fn from(err: MailError) -> Self {
        match err {
            MailError::PayloadExtraction { id } => Self::PayloadExtraction { id },
            other => Self::Mail(other),
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::UiElementNotFound { .. } => "ui_element_not_found",
            Self::ChallengeTimeout(_) => "challenge_timeout",
            Self::PayloadExtraction { .. } => "payload_extraction",
            Self::PostAuthVerification(_) => "post_auth_verification",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Browser(_) => "browser",
            Self::Mail(_) => "mail",
        }
    }
}

/// Export retrieval errors. An empty result is not an error.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Export download failed: {0}")]
    Download(String),

    #[error("Export could not be decoded as {encoding}")]
    Decode { encoding: String },

    #[error("Invalid date '{value}': expected YYYY/MM/DD")]
    InvalidDate { value: String },

    #[error("Date range is inverted: {from} > {to}")]
    InvertedRange { from: String, to: String },

    #[error("UI control not found: {0}")]
    UiElementNotFound(String),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),
}

/// Chat delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery channel {0} is not configured")]
    NotConfigured(String),

    #[error("Push to {channel} failed: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("Push to {channel} rejected with status {status}: {body}")]
    Rejected {
        channel: String,
        status: u16,
        body: String,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
