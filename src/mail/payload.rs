//! Challenge payload extraction from mail bodies.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::BodyPart;

/// The authentication artifact carried by a challenge email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChallengePayload {
    /// A short code to type into the portal.
    Code(String),
    /// A follow-up link to open in a second tab.
    Url(String),
}

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).expect("href pattern")
});

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("link pattern"));

/// Patterns used to recognise payloads in a body.
#[derive(Debug, Clone)]
pub struct PayloadPatterns {
    /// Code patterns; capture group 1 is the code. Tried in order.
    pub code: Vec<Regex>,
    /// Host/path pattern a follow-up link must match.
    pub link_domain: Regex,
}

impl PayloadPatterns {
    pub fn new(link_domain: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            code: vec![
                Regex::new(r"■認証コード\s+([A-Z0-9]{6})")?,
                Regex::new(r"認証コード\s*[：:]\s*([A-Z0-9]{4,8})")?,
            ],
            link_domain: Regex::new(link_domain)?,
        })
    }
}

/// A text-bearing body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPart<'a> {
    Plain(&'a str),
    Html(&'a str),
}

/// Find the first text-bearing part, depth first.
///
/// At each level a plain sibling wins over a markup sibling; only when
/// neither exists are nested containers searched.
pub fn find_text_part(body: &BodyPart) -> Option<TextPart<'_>> {
    match body {
        BodyPart::Text(t) => Some(TextPart::Plain(t)),
        BodyPart::Html(h) => Some(TextPart::Html(h)),
        BodyPart::Other => None,
        BodyPart::Multipart(children) => {
            if let Some(t) = children.iter().find_map(|p| match p {
                BodyPart::Text(t) => Some(TextPart::Plain(t.as_str())),
                _ => None,
            }) {
                return Some(t);
            }
            if let Some(h) = children.iter().find_map(|p| match p {
                BodyPart::Html(h) => Some(TextPart::Html(h.as_str())),
                _ => None,
            }) {
                return Some(h);
            }
            children
                .iter()
                .filter(|p| matches!(p, BodyPart::Multipart(_)))
                .find_map(find_text_part)
        }
    }
}

/// Extract a payload from a text part. Codes take precedence over links.
pub fn extract(part: TextPart<'_>, patterns: &PayloadPatterns) -> Option<ChallengePayload> {
    match part {
        TextPart::Plain(text) => find_code(text, patterns).or_else(|| find_link(text, patterns)),
        TextPart::Html(html) => find_code(&strip_html(html), patterns)
            .or_else(|| find_anchor(html, patterns))
            .or_else(|| find_link(html, patterns)),
    }
}

fn find_code(text: &str, patterns: &PayloadPatterns) -> Option<ChallengePayload> {
    patterns
        .code
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| ChallengePayload::Code(m.as_str().to_string()))
}

fn find_anchor(html: &str, patterns: &PayloadPatterns) -> Option<ChallengePayload> {
    HREF_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| decode_entities(m.as_str()))
        .find(|href| href.starts_with("http") && patterns.link_domain.is_match(href))
        .map(ChallengePayload::Url)
}

/// Generic link-shaped substring on the target domain.
fn find_link(text: &str, patterns: &PayloadPatterns) -> Option<ChallengePayload> {
    LINK_RE
        .find_iter(text)
        .map(|m| decode_entities(m.as_str()))
        .find(|link| patterns.link_domain.is_match(link))
        .map(ChallengePayload::Url)
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
}

/// Strip HTML tags, keeping line structure at tag boundaries.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push('\n');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
