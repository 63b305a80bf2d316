//! IMAP mailbox backend: raw IMAP over rustls, parsed with mail-parser.
//!
//! The mailbox is opened with `EXAMINE` and bodies are read with
//! `BODY.PEEK[]`, so lookups never change flags. Each call opens its own
//! short-lived connection on a blocking thread.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, PartType};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use super::{BodyPart, MailMessage, Mailbox, SearchFilter};
use crate::error::{ConfigError, MailError};

/// Nesting limit when walking multipart bodies.
const MAX_PART_DEPTH: usize = 16;

static INTERNALDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("internaldate pattern"));

static LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}\r\n$").expect("literal pattern"));

// ── Configuration ───────────────────────────────────────────────────

/// IMAP mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ImapConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("IMAP_HOST".into()))?;

        let port: u16 = std::env::var("IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("IMAP_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("IMAP_USERNAME".into()))?;
        let password = std::env::var("IMAP_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("IMAP_PASSWORD".into()))?;

        let mailbox = std::env::var("IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".to_string());

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            mailbox,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// Read-only IMAP mailbox.
pub struct ImapMailbox {
    config: Arc<ImapConfig>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<String>, MailError> {
        let cfg = Arc::clone(&self.config);
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&cfg)?;
            let ids = session.uid_search(&filter);
            session.logout();
            ids
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))?
    }

    async fn fetch(&self, id: &str) -> Result<MailMessage, MailError> {
        let cfg = Arc::clone(&self.config);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&cfg)?;
            let msg = session.uid_fetch(&id);
            session.logout();
            msg
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))?
    }
}

// ── Protocol ────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// A command argument: an atom/quoted string, or a synchronizing literal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Atom(String),
    Literal(Vec<u8>),
}

/// Open a TCP connection, trying each resolved address within `timeout`.
fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, MailError> {
    let unreachable = |reason: String| MailError::Connection(format!("{host}:{port}: {reason}"));
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| unreachable(e.to_string()))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_error = Some(e),
        }
    }
    Err(unreachable(match last_error {
        Some(e) => e.to_string(),
        None => "no addresses resolved".into(),
    }))
}

/// Untagged lines and literal payloads of one command response.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession {
    tls: TlsStream,
    tag: u32,
}

impl ImapSession {
    /// Connect, log in, and open the mailbox read-only.
    fn open(config: &ImapConfig) -> Result<Self, MailError> {
        let tcp = connect(&config.host, config.port, config.connect_timeout)?;
        tcp.set_read_timeout(Some(config.read_timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailError::Connection(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailError::Protocol(format!("unexpected greeting: {}", greeting.trim())));
        }

        let login = vec![
            Arg::Atom("LOGIN".into()),
            astring(&config.username),
            astring(config.password.expose_secret()),
        ];
        match session.command(&login) {
            Ok(_) => {}
            Err(MailError::Protocol(_)) => {
                return Err(MailError::LoginRejected {
                    username: config.username.clone(),
                });
            }
            Err(e) => return Err(e),
        }

        session.command(&[Arg::Atom("EXAMINE".into()), astring(&config.mailbox)])?;
        Ok(session)
    }

    fn uid_search(&mut self, filter: &SearchFilter) -> Result<Vec<String>, MailError> {
        let resp = self.command(&search_command(filter))?;
        Ok(parse_search(&resp.lines))
    }

    fn uid_fetch(&mut self, uid: &str) -> Result<MailMessage, MailError> {
        let resp = self.command(&[
            Arg::Atom("UID".into()),
            Arg::Atom("FETCH".into()),
            Arg::Atom(uid.to_string()),
            Arg::Atom("(INTERNALDATE BODY.PEEK[])".into()),
        ])?;

        let raw = resp
            .literals
            .first()
            .ok_or_else(|| MailError::UnparseableMessage { id: uid.to_string() })?;
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MailError::UnparseableMessage { id: uid.to_string() })?;

        let arrived_at = resp
            .lines
            .iter()
            .find_map(|l| parse_internal_date(l))
            .or_else(|| {
                parsed
                    .date()
                    .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            })
            .ok_or_else(|| MailError::UnparseableMessage { id: uid.to_string() })?;

        Ok(MailMessage {
            id: uid.to_string(),
            arrived_at,
            body: body_tree(&parsed),
        })
    }

    fn logout(&mut self) {
        let _ = self.command(&[Arg::Atom("LOGOUT".into())]);
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("A{}", self.tag)
    }

    /// Send a command and collect its response until the tagged status line.
    fn command(&mut self, args: &[Arg]) -> Result<Response, MailError> {
        let tag = self.next_tag();
        let mut pending = tag.clone();

        for arg in args {
            match arg {
                Arg::Atom(atom) => {
                    pending.push(' ');
                    pending.push_str(atom);
                }
                Arg::Literal(bytes) => {
                    pending.push_str(&format!(" {{{}}}\r\n", bytes.len()));
                    self.tls.write_all(pending.as_bytes())?;
                    self.tls.flush()?;
                    pending.clear();

                    let cont = self.read_line()?;
                    if !cont.starts_with('+') {
                        return Err(MailError::Protocol(format!(
                            "literal refused: {}",
                            cont.trim()
                        )));
                    }
                    self.tls.write_all(bytes)?;
                }
            }
        }
        pending.push_str("\r\n");
        self.tls.write_all(pending.as_bytes())?;
        self.tls.flush()?;

        let mut resp = Response::default();
        let status_prefix = format!("{tag} ");
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&status_prefix) {
                if status.starts_with("OK") {
                    return Ok(resp);
                }
                return Err(MailError::Protocol(status.trim().to_string()));
            }
            if let Some(size) = literal_size(&line) {
                let mut buf = vec![0u8; size];
                self.tls.read_exact(&mut buf)?;
                resp.literals.push(buf);
            }
            resp.lines.push(line);
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailError::Connection("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ── Helpers (pure, tested) ──────────────────────────────────────────

/// Quote a string argument, or send it as a literal when it is not
/// plain ASCII.
fn astring(value: &str) -> Arg {
    if value.is_ascii() && !value.contains(['\r', '\n']) {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        Arg::Atom(format!("\"{escaped}\""))
    } else {
        Arg::Literal(value.as_bytes().to_vec())
    }
}

fn search_command(filter: &SearchFilter) -> Vec<Arg> {
    let mut criteria = vec![
        Arg::Atom("SINCE".into()),
        // SINCE compares against the server's local date; a day earlier
        // keeps mail near midnight in range. Arrival times are checked later.
        Arg::Atom((filter.since - chrono::Duration::days(1)).format("%d-%b-%Y").to_string()),
    ];
    if let Some(from) = &filter.from {
        criteria.push(Arg::Atom("FROM".into()));
        criteria.push(astring(from));
    }
    if let Some(subject) = &filter.subject {
        criteria.push(Arg::Atom("SUBJECT".into()));
        criteria.push(astring(subject));
    }

    let mut args = vec![Arg::Atom("UID".into()), Arg::Atom("SEARCH".into())];
    if criteria.iter().any(|a| matches!(a, Arg::Literal(_))) {
        args.push(Arg::Atom("CHARSET".into()));
        args.push(Arg::Atom("UTF-8".into()));
    }
    args.extend(criteria);
    args
}

fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

fn literal_size(line: &str) -> Option<usize> {
    LITERAL_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse `INTERNALDATE "17-Jul-2026 02:44:25 -0700"` from a FETCH line.
fn parse_internal_date(line: &str) -> Option<DateTime<Utc>> {
    let raw = INTERNALDATE_RE.captures(line)?.get(1)?.as_str().trim();
    DateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Convert mail-parser's flat part list into a nested body tree.
fn body_tree(message: &mail_parser::Message<'_>) -> BodyPart {
    build_part(message, 0, 0)
}

fn build_part(message: &mail_parser::Message<'_>, index: usize, depth: usize) -> BodyPart {
    if depth > MAX_PART_DEPTH {
        return BodyPart::Other;
    }
    let Some(part) = message.parts.get(index) else {
        return BodyPart::Other;
    };
    match &part.body {
        PartType::Text(text) => BodyPart::Text(text.to_string()),
        PartType::Html(html) => BodyPart::Html(html.to_string()),
        PartType::Multipart(children) => BodyPart::Multipart(
            children
                .iter()
                .map(|id| build_part(message, *id as usize, depth + 1))
                .collect(),
        ),
        _ => BodyPart::Other,
    }
}
