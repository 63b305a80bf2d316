//! Dividend record types produced by the export parser.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Column labels of the detail table, in export order.
pub mod columns {
    pub const SETTLEMENT_DATE: &str = "受渡日";
    pub const ACCOUNT: &str = "口座";
    pub const PRODUCT: &str = "商品";
    pub const SECURITY_NAME: &str = "銘柄名";
    pub const QUANTITY: &str = "数量";
    pub const NET_AMOUNT: &str = "受取額(税引後・円)";

    pub const ALL: [&str; 6] = [
        SETTLEMENT_DATE,
        ACCOUNT,
        PRODUCT,
        SECURITY_NAME,
        QUANTITY,
        NET_AMOUNT,
    ];
}

/// One dividend payment row from the detail table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendRecord {
    pub settlement_date: String,
    pub account: String,
    pub product: String,
    pub security_name: String,
    pub quantity: String,
    /// Net amount in yen, verbatim from the export (may contain `,`).
    pub net_amount: String,
}

/// A category subtotal row (e.g. `国内株式(現物)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub label: String,
    pub yen: Option<Decimal>,
    pub usd: Option<Decimal>,
}

/// Metadata scanned from the top of the export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendSummary {
    /// Reporting period as printed, e.g. `2025/8/4-2025/8/9`.
    pub period: Option<String>,
    pub total_yen: Option<Decimal>,
    pub total_usd: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_totals: Vec<CategoryTotal>,
}

impl DividendSummary {
    pub fn has_totals(&self) -> bool {
        self.total_yen.is_some() || self.total_usd.is_some()
    }
}

/// Summary and detail rows parsed from one export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedExport {
    pub summary: DividendSummary,
    pub records: Vec<DividendRecord>,
}

/// Parse an amount cell, ignoring whitespace and thousand separators.
///
/// Returns `None` for empty or non-numeric cells.
pub fn parse_amount(value: &str) -> Option<Decimal> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// Render a decimal with `,` thousand grouping and no trailing zeros.
pub fn group_thousands(value: Decimal) -> String {
    let text = value.normalize().to_string();
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}
