//! Portal controls and text markers.
//!
//! Each control lists its strategies most-specific first. When the portal
//! changes its markup, add a strategy here rather than a code path in the
//! orchestrator.

use crate::browser::{Locator, LocatorChain, Predicate};

/// Wording shown when the portal rejects the user id or password.
pub const LOGIN_ERROR_MARKERS: &[&str] = &[
    "ユーザーネームまたはパスワードが違います",
    "ユーザーネームまたはパスワードに誤りがあります",
    "ログインできませんでした",
];

/// Text only present once logged in.
pub const READY_MARKERS: &[&str] = &["ログアウト", "口座管理", "ポートフォリオ"];

/// Text shown by the dividend view when the range has no rows.
pub const NO_RESULTS_MARKERS: &[&str] = &[
    "該当するデータはありません",
    "該当する明細はありません",
    "対象期間のデータがありません",
];

pub fn user_id_field() -> LocatorChain {
    LocatorChain::new("user id field")
        .then("name", Locator::css(r#"input[name="user_id"]"#), Predicate::Visible)
        .then("id", Locator::css("#username"), Predicate::Visible)
        .then(
            "name contains user",
            Locator::xpath("//input[@type='text' and contains(@name, 'user')]"),
            Predicate::Visible,
        )
}

pub fn password_field() -> LocatorChain {
    LocatorChain::new("password field")
        .then("name", Locator::css(r#"input[name="user_password"]"#), Predicate::Visible)
        .then("id", Locator::css("#password"), Predicate::Visible)
        .then("type", Locator::css(r#"input[type="password"]"#), Predicate::Visible)
}

pub fn login_button() -> LocatorChain {
    LocatorChain::new("login button")
        .then("name", Locator::css(r#"button[name="ACT_loginHome"]"#), Predicate::Interactive)
        .then("legacy name", Locator::css(r#"input[name="ACT_login"]"#), Predicate::Interactive)
        .then("label", Locator::button_text("ログイン"), Predicate::Interactive)
}

/// The affordance that makes the portal send the challenge email.
pub fn send_challenge() -> LocatorChain {
    LocatorChain::new("send challenge")
        .then("id", Locator::css("#code-display"), Predicate::Interactive)
        .then("label", Locator::button_text("Eメールを送信する"), Predicate::Interactive)
        .then("short label", Locator::button_text("送信する"), Predicate::Interactive)
        .then("link", Locator::link_text("認証コードを送信"), Predicate::Interactive)
}

/// The short rotating code shown on the primary tab.
pub fn rotating_code() -> LocatorChain {
    LocatorChain::new("rotating code")
        .then("id", Locator::css("#randomString"), Predicate::Visible)
        .then("partial id", Locator::css(r#"[id*="randomString"]"#), Predicate::Visible)
}

/// Primary-tab input for a code delivered by email.
pub fn emailed_code_input() -> LocatorChain {
    LocatorChain::new("emailed code input")
        .then("name", Locator::css(r#"input[name="device_code"]"#), Predicate::Interactive)
        .then(
            "legacy name",
            Locator::css(r#"input[name="i_authentication_word"]"#),
            Predicate::Interactive,
        )
}

/// Second-tab input for the rotating code.
pub fn verify_code_input() -> LocatorChain {
    LocatorChain::new("verification code input")
        .then("name", Locator::css(r#"input[name="verifyCode"]"#), Predicate::Interactive)
        .then("legacy name", Locator::css(r#"input[name="userInput"]"#), Predicate::Interactive)
        .then(
            "two-char text input",
            Locator::xpath("//input[@type='text' and @maxlength='2']"),
            Predicate::Interactive,
        )
}

/// Second-tab submit control.
pub fn verify_submit() -> LocatorChain {
    LocatorChain::new("verification submit")
        .then("value", Locator::css(r#"input[value="送信"]"#), Predicate::Interactive)
        .then("label", Locator::button_text("認証する"), Predicate::Interactive)
        .then("submit", Locator::css(r#"button[type="submit"]"#), Predicate::Interactive)
}

pub fn consent_checkbox() -> LocatorChain {
    LocatorChain::new("consent checkbox")
        .then(
            "name",
            Locator::css(r#"input[name="device_string_checkbox"]"#),
            Predicate::Present,
        )
        .then(
            "label",
            Locator::xpath("//label[contains(., '一致を確認')]//input[@type='checkbox']"),
            Predicate::Present,
        )
}

pub fn confirm_registration() -> LocatorChain {
    LocatorChain::new("confirm registration")
        .then("label", Locator::button_text("デバイスを登録する"), Predicate::Interactive)
        .then("short label", Locator::button_text("登録"), Predicate::Interactive)
        .then("legacy name", Locator::css(r#"input[name="ACT_2fa_login"]"#), Predicate::Interactive)
}

pub fn csv_download() -> LocatorChain {
    LocatorChain::new("csv download")
        .then("label", Locator::button_text("CSVダウンロード"), Predicate::Interactive)
        .then("link", Locator::link_text("CSV"), Predicate::Interactive)
        .then("href", Locator::css(r#"a[href*="csv"]"#), Predicate::Interactive)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn all() -> Vec<LocatorChain> {
        vec![
            user_id_field(),
            password_field(),
            login_button(),
            send_challenge(),
            rotating_code(),
            emailed_code_input(),
            verify_code_input(),
            verify_submit(),
            consent_checkbox(),
            confirm_registration(),
            csv_download(),
        ]
    }

    #[test]
    fn every_control_has_a_fallback() {
        for chain in all() {
            assert!(chain.len() >= 2, "{} has no fallback strategy", chain.control());
        }
    }

    #[test]
    fn control_names_are_unique() {
        let names: HashSet<_> = all().iter().map(|c| c.control()).collect();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn strategy_names_unique_within_chain() {
        for chain in all() {
            let names: HashSet<_> = chain.strategies().iter().map(|s| s.name).collect();
            assert_eq!(names.len(), chain.len(), "{}", chain.control());
        }
    }

    #[test]
    fn marker_lists_are_disjoint() {
        for m in READY_MARKERS {
            assert!(!LOGIN_ERROR_MARKERS.iter().any(|e| e.contains(m)));
            assert!(!NO_RESULTS_MARKERS.iter().any(|e| e.contains(m)));
        }
    }
}
