//! Dividend export records: data model and CSV parser.

pub mod model;
pub mod parser;

pub use model::{CategoryTotal, DividendRecord, DividendSummary, ParsedExport};
pub use parser::parse;
