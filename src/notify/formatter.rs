//! Notification formatter: pages dividend records into chat cards.
//!
//! `format` is the data-level operation (pages + summary placement);
//! `to_message` and `to_text` render a payload for delivery or preview.

use serde::Serialize;
use serde_json::{Value, json};

use super::OutboundMessage;
use crate::records::model::{DividendRecord, DividendSummary, group_thousands};

/// Records per card page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Card title.
pub const TITLE: &str = "配当金のお知らせ";

const ICON_URL: &str = "https://cha-line.vercel.app/icon.png";
const MUTED: &str = "#888888";

/// A bounded slice of records; only page 0 carries the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub records: Vec<DividendRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<DividendSummary>,
}

/// Paged notification ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub alt_text: String,
    pub pages: Vec<Page>,
}

impl NotificationPayload {
    /// All records in page order.
    pub fn records(&self) -> impl Iterator<Item = &DividendRecord> {
        self.pages.iter().flat_map(|p| p.records.iter())
    }

    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|p| p.records.len()).sum()
    }
}

/// Pages records into fixed-size chunks.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    page_size: usize,
}

impl Default for Formatter {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Formatter {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Build the paged payload. Produces `ceil(N / page_size)` pages.
    pub fn format(&self, summary: &DividendSummary, records: &[DividendRecord]) -> NotificationPayload {
        let pages = records
            .chunks(self.page_size)
            .enumerate()
            .map(|(i, chunk)| Page {
                records: chunk.to_vec(),
                summary: (i == 0).then(|| summary.clone()),
            })
            .collect();

        NotificationPayload {
            alt_text: alt_text(summary, records.len()),
            pages,
        }
    }
}

/// Preview string shown in chat lists and push notifications.
pub fn alt_text(summary: &DividendSummary, count: usize) -> String {
    match summary.total_yen {
        Some(total) if count > 0 => format!(
            "🎉 配当金が入金されました。合計 {}円 / {}件",
            group_thousands(total),
            count
        ),
        _ => TITLE.to_string(),
    }
}

/// Render the payload as a card message: one bubble, or a carousel.
pub fn to_message(payload: &NotificationPayload) -> OutboundMessage {
    let bubbles: Vec<Value> = payload.pages.iter().map(bubble).collect();

    let contents = match bubbles.len() {
        0 => return text_card(TITLE, "該当する配当金はありません"),
        1 => bubbles.into_iter().next().unwrap_or(Value::Null),
        _ => json!({ "type": "carousel", "contents": bubbles }),
    };

    OutboundMessage::Flex {
        alt_text: payload.alt_text.clone(),
        contents,
    }
}

/// A titled card with one text line per input line.
pub fn text_card(title: &str, text: &str) -> OutboundMessage {
    let mut lines: Vec<Value> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| json!({ "type": "text", "text": l, "wrap": true }))
        .collect();
    if lines.is_empty() {
        lines.push(json!({ "type": "text", "text": "(内容なし)" }));
    }

    OutboundMessage::Flex {
        alt_text: title.to_string(),
        contents: json!({
            "type": "bubble",
            "size": "mega",
            "header": {
                "type": "box",
                "layout": "vertical",
                "contents": [{ "type": "text", "text": title, "weight": "bold", "size": "lg" }]
            },
            "body": { "type": "box", "layout": "vertical", "spacing": "md", "contents": lines }
        }),
    }
}

/// Plain-text rendering for logs and the CLI preview.
pub fn to_text(payload: &NotificationPayload) -> String {
    let mut out = Vec::new();
    let summary = payload.pages.first().and_then(|p| p.summary.as_ref());

    if let Some(period) = summary.and_then(|s| s.period.as_deref()) {
        out.push(format!("[期間] {period}"));
    }
    for rec in payload.records() {
        out.push(format!(
            "- {}: {}円 (受渡日: {})",
            rec.security_name, rec.net_amount, rec.settlement_date
        ));
    }
    if let Some(summary) = summary {
        if let Some(total) = summary.total_yen {
            out.push(String::new());
            out.push(format!("合計: {}円", group_thousands(total)));
        }
        if let Some(usd) = summary.total_usd {
            out.push(format!("(USD換算: {}$)", group_thousands(usd)));
        }
    }
    out.join("\n")
}

// ── Card pieces ─────────────────────────────────────────────────────

fn bubble(page: &Page) -> Value {
    let mut header = vec![json!({
        "type": "box",
        "layout": "horizontal",
        "justifyContent": "flex-start",
        "alignItems": "center",
        "spacing": "sm",
        "contents": [
            { "type": "image", "url": ICON_URL, "size": "xxs", "flex": 0 },
            { "type": "text", "text": TITLE, "weight": "bold", "size": "lg", "margin": "sm", "flex": 1, "align": "start", "wrap": true }
        ]
    })];

    let mut bubble = json!({
        "type": "bubble",
        "size": "mega",
        "body": {
            "type": "box",
            "layout": "vertical",
            "spacing": "xs",
            "contents": record_blocks(&page.records)
        }
    });

    if let Some(summary) = &page.summary {
        if let Some(period) = &summary.period {
            header.push(json!({ "type": "text", "text": period, "size": "sm", "color": MUTED }));
        }
        let footer = footer_blocks(summary);
        if !footer.is_empty() {
            bubble["footer"] = json!({
                "type": "box",
                "layout": "vertical",
                "spacing": "sm",
                "contents": footer
            });
        }
    }

    bubble["header"] = json!({
        "type": "box",
        "layout": "vertical",
        "paddingBottom": "xs",
        "contents": header
    });
    bubble
}

fn record_blocks(records: &[DividendRecord]) -> Vec<Value> {
    let mut blocks = Vec::with_capacity(records.len() * 2);
    for rec in records {
        let name = match market_flag(&rec.product) {
            Some(flag) => format!("{flag} {}", rec.security_name),
            None => rec.security_name.clone(),
        };
        blocks.push(json!({
            "type": "box",
            "layout": "horizontal",
            "contents": [
                { "type": "text", "text": name, "weight": "bold", "flex": 4, "wrap": true },
                { "type": "text", "text": format!("{}円", rec.net_amount), "align": "end", "flex": 3 }
            ]
        }));

        let account = short_account_label(&rec.account);
        let meta = if account.is_empty() {
            format!("数量: {} / 受渡日: {}", rec.quantity, rec.settlement_date)
        } else {
            format!(
                "数量: {} / 受渡日: {} / {}",
                rec.quantity, rec.settlement_date, account
            )
        };
        blocks.push(json!({ "type": "text", "text": meta, "size": "xs", "color": MUTED, "wrap": true }));
    }
    blocks
}

fn footer_blocks(summary: &DividendSummary) -> Vec<Value> {
    let mut blocks = Vec::new();
    if summary.has_totals() {
        blocks.push(json!({ "type": "separator" }));
    }

    for ct in &summary.category_totals {
        let yen = format!("{}円", group_thousands(ct.yen.unwrap_or_default()));
        let right = match ct.usd {
            Some(usd) => format!("({}$) {yen}", group_thousands(usd)),
            None => yen,
        };
        blocks.push(label_row(&ct.label, &right, false));
    }
    if let Some(total) = summary.total_yen {
        blocks.push(label_row("合計", &format!("{}円", group_thousands(total)), true));
    }
    if let Some(usd) = summary.total_usd {
        blocks.push(label_row("USD換算", &format!("{}$", group_thousands(usd)), true));
    }
    blocks
}

fn label_row(label: &str, value: &str, bold: bool) -> Value {
    let mut left = json!({ "type": "text", "text": label, "flex": 2 });
    if bold {
        left["weight"] = json!("bold");
    }
    json!({
        "type": "box",
        "layout": "horizontal",
        "contents": [left, { "type": "text", "text": value, "align": "end", "flex": 3 }]
    })
}

fn market_flag(product: &str) -> Option<&'static str> {
    if product.contains("米国") {
        Some("🇺🇸")
    } else if product.contains("国内") || product.contains("現物") {
        Some("🇯🇵")
    } else {
        None
    }
}

fn short_account_label(account: &str) -> String {
    account
        .replace("NISA（成長投資枠）", "NISA成長")
        .replace("NISA（つみたて投資枠）", "NISAつみたて")
}
