//! Dividend relay: fetches the brokerage dividend export behind the
//! portal's device challenge and pushes it to chat as paged cards.

pub mod browser;
pub mod config;
pub mod error;
pub mod export;
pub mod mail;
pub mod notify;
pub mod records;
pub mod run;
pub mod server;
pub mod session;
