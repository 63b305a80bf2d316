//! Configuration types.
//!
//! Every struct is built from environment variables. The binary loads a
//! `.env` file first, so the same names work in both places.

use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use secrecy::SecretString;

use crate::browser::Backoff;
use crate::browser::webdriver::WebDriverConfig;
use crate::error::ConfigError;
use crate::mail::imap::ImapConfig;

const DEFAULT_LOGIN_URL: &str = "https://www.sbisec.co.jp/ETGate/?_ControlID=WPLETlgR001Control&_PageID=WPLETlgR001Rlgn50&_DataStoreID=DSWPLETlgR001Control&_ActionID=login&getFlg=on";
const DEFAULT_DIVIDENDS_URL: &str = "https://site.sbisec.co.jp/account/assets/dividends";

/// Everything a scheduled run needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub portal: PortalConfig,
    pub challenge: ChallengeMailConfig,
    pub dates: DateDefaults,
    pub imap: ImapConfig,
    pub webdriver: WebDriverConfig,
    pub line: LineConfig,
    pub timing: SessionTiming,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            portal: PortalConfig::from_env()?,
            challenge: ChallengeMailConfig::from_env()?,
            dates: DateDefaults::from_env(),
            imap: ImapConfig::from_env()?,
            webdriver: WebDriverConfig::from_env()?,
            line: LineConfig::from_env()?,
            timing: SessionTiming::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}

/// Brokerage portal location and credentials.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub user_id: String,
    pub password: SecretString,
    pub login_url: String,
    pub dividends_url: String,
    /// The portal's local time zone, used for "today".
    pub utc_offset: FixedOffset,
}

impl PortalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let hours: i32 = parse_or(&get, "PORTAL_UTC_OFFSET_HOURS", 9)?;
        let utc_offset = FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "PORTAL_UTC_OFFSET_HOURS".into(),
                message: format!("{hours} is out of range"),
            }
        })?;

        Ok(Self {
            user_id: required(&get, "PORTAL_USER_ID")?,
            password: SecretString::from(required(&get, "PORTAL_PASSWORD")?),
            login_url: get("PORTAL_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            dividends_url: get("PORTAL_DIVIDENDS_URL")
                .unwrap_or_else(|| DEFAULT_DIVIDENDS_URL.to_string()),
            utc_offset,
        })
    }
}

/// How challenge emails are recognised.
#[derive(Debug, Clone)]
pub struct ChallengeMailConfig {
    pub sender: String,
    pub subject: String,
    /// Regex a follow-up link's URL must match.
    pub link_domain: String,
}

impl Default for ChallengeMailConfig {
    fn default() -> Self {
        Self {
            sender: "info@sbisec.co.jp".to_string(),
            subject: "認証コード".to_string(),
            link_domain: r"sbisec\.co\.jp".to_string(),
        }
    }
}

impl ChallengeMailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let link_domain = get("CHALLENGE_LINK_DOMAIN").unwrap_or(defaults.link_domain);
        if let Err(e) = regex::Regex::new(&link_domain) {
            return Err(ConfigError::InvalidValue {
                key: "CHALLENGE_LINK_DOMAIN".into(),
                message: e.to_string(),
            });
        }
        Ok(Self {
            sender: get("CHALLENGE_SENDER").unwrap_or(defaults.sender),
            subject: get("CHALLENGE_SUBJECT").unwrap_or(defaults.subject),
            link_domain,
        })
    }
}

/// Default export range when a trigger does not name one (`YYYY/MM/DD`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateDefaults {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl DateDefaults {
    pub fn from_env() -> Self {
        Self::from_lookup(env)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            from: get("DIVIDEND_DATE_FROM").filter(|s| !s.trim().is_empty()),
            to: get("DIVIDEND_DATE_TO").filter(|s| !s.trim().is_empty()),
        }
    }
}

/// LINE Messaging API credentials and recipient.
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub access_token: SecretString,
    pub user_id: String,
}

impl LineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let user_id = get("LINE_USER_ID")
            .or_else(|| get("MY_LINE_USER_ID"))
            .ok_or_else(|| ConfigError::MissingEnvVar("LINE_USER_ID".into()))?;
        Ok(Self {
            access_token: SecretString::from(required(&get, "LINE_CHANNEL_ACCESS_TOKEN")?),
            user_id,
        })
    }
}

/// Waits and polling schedules of the authentication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Schedule for every UI-locating wait.
    pub backoff: Backoff,
    pub mail_poll_interval: Duration,
    /// Overall bound for correlating the challenge email. Three rotations
    /// of the 40s rotating code.
    pub challenge_timeout: Duration,
    /// Tolerated clock difference between the mail server and this host.
    pub clock_skew: Duration,
    /// Pause before activating the registration control.
    pub settle_delay: Duration,
    pub download_timeout: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            mail_poll_interval: Duration::from_secs(5),
            challenge_timeout: Duration::from_secs(120),
            clock_skew: Duration::from_secs(30),
            settle_delay: Duration::from_millis(1500),
            download_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionTiming {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let max_attempts: u32 = parse_or(&get, "UI_MAX_ATTEMPTS", d.backoff.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "UI_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self {
            backoff: Backoff {
                max_attempts,
                ..d.backoff
            },
            mail_poll_interval: Duration::from_secs(parse_or(
                &get,
                "MAIL_POLL_INTERVAL_SECS",
                d.mail_poll_interval.as_secs(),
            )?),
            challenge_timeout: Duration::from_secs(parse_or(
                &get,
                "CHALLENGE_TIMEOUT_SECS",
                d.challenge_timeout.as_secs(),
            )?),
            clock_skew: Duration::from_secs(parse_or(
                &get,
                "MAIL_CLOCK_SKEW_SECS",
                d.clock_skew.as_secs(),
            )?),
            ..d
        })
    }
}

/// HTTP trigger surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_or(&env, "PORT", Self::default().port)?,
        })
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
