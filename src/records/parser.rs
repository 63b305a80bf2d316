//! Dividend export parser.
//!
//! The export is not strictly columnar: a metadata block (period, totals,
//! category subtotals) precedes the detail table, and unquoted amounts such
//! as `5,220.24` spill over into extra trailing cells. Parsing is total:
//! any decoded text yields a (possibly empty) result.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::model::{
    CategoryTotal, DividendRecord, DividendSummary, ParsedExport, columns, parse_amount,
};

static PERIOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}/\d{1,2}/\d{1,2}-\d{4}/\d{1,2}/\d{1,2}").expect("period pattern")
});

/// Labels marking a grand-total row in column 0.
const TOTAL_LABELS: &[&str] = &["合計", "小計"];

/// Labels marking a category-subtotal row in column 0.
const CATEGORY_LABELS: &[&str] = &["国内株式", "米国株式", "現物"];

/// Parse decoded export text into a summary and detail records.
pub fn parse(raw_text: &str) -> ParsedExport {
    let rows = tokenize(raw_text);
    let summary = scan_summary(&rows);

    let Some(header_index) = rows.iter().position(|r| is_detail_header(r)) else {
        debug!(rows = rows.len(), "No detail header found in export");
        return ParsedExport {
            summary,
            records: Vec::new(),
        };
    };

    let min_cells = columns::ALL.len() - 1;
    let records: Vec<DividendRecord> = rows[header_index + 1..]
        .iter()
        .filter(|r| r.first().is_some_and(|c| !c.trim().is_empty()))
        .filter(|r| r.len() >= min_cells)
        .map(|r| to_record(r))
        .filter(|rec| !is_repeated_header(rec))
        .collect();

    debug!(
        header_row = header_index,
        records = records.len(),
        "Parsed dividend export"
    );

    ParsedExport { summary, records }
}

/// Split text into rows of flexible width. Rows the CSV reader cannot
/// decode are skipped.
fn tokenize(raw_text: &str) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw_text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.byte_records() {
        match result {
            Ok(record) => rows.push(
                record
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).into_owned())
                    .collect(),
            ),
            Err(e) => debug!("Skipping unreadable export row: {e}"),
        }
    }
    rows
}

/// Scan every row for the period, the first grand total, and category subtotals.
fn scan_summary(rows: &[Vec<String>]) -> DividendSummary {
    let mut summary = DividendSummary::default();

    for row in rows {
        let c0 = cell(row, 0);
        let c1 = cell(row, 1);
        let c2 = cell(row, 2);
        let has_values = !c1.is_empty() || !c2.is_empty();

        if summary.period.is_none() && PERIOD_RE.is_match(c1) {
            summary.period = Some(c1.trim().to_string());
        }

        if has_values && TOTAL_LABELS.iter().any(|l| c0.contains(l)) {
            if summary.total_yen.is_none() {
                summary.total_yen = parse_amount(c1);
            }
            if summary.total_usd.is_none() {
                summary.total_usd = parse_amount(c2);
            }
        }

        if has_values && CATEGORY_LABELS.iter().any(|l| c0.contains(l)) {
            summary.category_totals.push(CategoryTotal {
                label: c0.trim().to_string(),
                yen: parse_amount(c1),
                usd: parse_amount(c2),
            });
        }
    }

    summary
}

fn is_detail_header(row: &[String]) -> bool {
    let joined = row.join(",");
    columns::ALL.iter().all(|h| joined.contains(h))
}

/// Map the first five cells positionally; rejoin the rest into the amount.
fn to_record(row: &[String]) -> DividendRecord {
    let field = |i: usize| unquote(cell(row, i)).to_string();
    let net_amount = row
        .iter()
        .skip(5)
        .map(|c| unquote(c))
        .collect::<Vec<_>>()
        .join(",");

    DividendRecord {
        settlement_date: field(0),
        account: field(1),
        product: field(2),
        security_name: field(3),
        quantity: field(4),
        net_amount,
    }
}

fn is_repeated_header(rec: &DividendRecord) -> bool {
    rec.security_name.is_empty()
        || rec.security_name == columns::SECURITY_NAME
        || rec.settlement_date.is_empty()
        || rec.settlement_date == columns::SETTLEMENT_DATE
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}
