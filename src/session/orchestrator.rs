//! Session orchestrator: drives the portal from the login form to an
//! authenticated landing page.
//!
//! The flow is linear: every step performs its UI work and then advances
//! [`SessionState`] by exactly one state. Any error aborts the attempt,
//! moves the state to `Failed`, and closes auxiliary tabs before
//! returning.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::selectors;
use super::state::SessionState;
use crate::browser::{Browser, LocatorChain, Resolved, TabId, resolve};
use crate::config::SessionTiming;
use crate::error::{MailError, SessionError};
use crate::mail::correlator::ExcludeSet;
use crate::mail::{ChallengeEmail, ChallengePayload, ChallengeTrigger, MailCorrelator};

/// Portal login credentials. Used once per attempt and never logged.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub password: SecretString,
}

/// A browser session that reached the authenticated landing state.
pub struct AuthenticatedSession {
    browser: Arc<dyn Browser>,
    primary: TabId,
}

impl AuthenticatedSession {
    pub(crate) fn new(browser: Arc<dyn Browser>, primary: TabId) -> Self {
        Self { browser, primary }
    }

    pub fn browser(&self) -> &dyn Browser {
        self.browser.as_ref()
    }

    pub fn primary_tab(&self) -> &TabId {
        &self.primary
    }
}

impl std::fmt::Debug for AuthenticatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedSession")
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

pub struct SessionOrchestrator {
    browser: Arc<dyn Browser>,
    correlator: MailCorrelator,
    login_url: String,
    timing: SessionTiming,
    state: SessionState,
    primary: Option<TabId>,
    /// Tab opened for a follow-up link, until the code is submitted there.
    challenge_tab: Option<TabId>,
    /// Every tab opened by this attempt; closed on exit.
    opened_tabs: Vec<TabId>,
}

impl SessionOrchestrator {
    pub fn new(
        browser: Arc<dyn Browser>,
        correlator: MailCorrelator,
        login_url: impl Into<String>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            browser,
            correlator,
            login_url: login_url.into(),
            timing,
            state: SessionState::default(),
            primary: None,
            challenge_tab: None,
            opened_tabs: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the whole flow. On failure the state is `Failed(kind)`.
    pub async fn authenticate(
        &mut self,
        credentials: &Credentials,
    ) -> Result<AuthenticatedSession, SessionError> {
        let result = self.run_steps(credentials).await;
        self.close_opened_tabs().await;

        match result {
            Ok(primary) => Ok(AuthenticatedSession::new(Arc::clone(&self.browser), primary)),
            Err(e) => {
                warn!(state = %self.state, error = %e, "Authentication failed");
                if self.state.can_transition_to(&SessionState::Failed(String::new())) {
                    self.state = SessionState::Failed(e.kind().to_string());
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self, credentials: &Credentials) -> Result<TabId, SessionError> {
        let primary = self.browser.current_tab().await?;
        self.primary = Some(primary.clone());

        self.submit_credentials(credentials).await?;
        let trigger = self.trigger_challenge().await?;
        let challenge = self.resolve_challenge(&trigger).await?;
        self.submit_challenge(&challenge.payload).await?;
        self.confirm_device_registration().await?;
        self.await_ready().await?;
        Ok(primary)
    }

    /// Fill and submit the login form.
    pub async fn submit_credentials(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        self.browser.goto(&self.login_url).await?;

        let user = self.require(&selectors::user_id_field()).await?;
        self.browser.fill(&user.element, &credentials.user_id).await?;

        let password = self.require(&selectors::password_field()).await?;
        self.browser
            .fill(&password.element, credentials.password.expose_secret())
            .await?;

        let button = self.require(&selectors::login_button()).await?;
        self.browser.click(&button.element).await?;

        let text = self.browser.page_text().await?;
        if let Some(marker) = selectors::LOGIN_ERROR_MARKERS
            .iter()
            .find(|m| text.contains(*m))
        {
            return Err(SessionError::Auth((*marker).to_string()));
        }

        self.transition(SessionState::CredentialsSubmitted)
    }

    /// Activate the "send challenge" affordance. The trigger instant is
    /// taken just before activation.
    pub async fn trigger_challenge(&mut self) -> Result<ChallengeTrigger, SessionError> {
        let control = self.require(&selectors::send_challenge()).await?;
        let trigger = ChallengeTrigger::now();
        self.browser.click(&control.element).await?;

        info!(trigger = %trigger.instant(), strategy = control.strategy, "Challenge requested");
        self.transition(SessionState::ChallengeTriggered)?;
        Ok(trigger)
    }

    /// Poll the mailbox until the challenge email arrives. A follow-up
    /// link is opened in a second tab.
    pub async fn resolve_challenge(
        &mut self,
        trigger: &ChallengeTrigger,
    ) -> Result<ChallengeEmail, SessionError> {
        let timeout = self.timing.challenge_timeout;
        let deadline = Instant::now() + timeout;
        let mut exclude = ExcludeSet::new();
        let mut polls = 0u32;

        let challenge = loop {
            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = self.correlator.find_challenge_payload(trigger, &mut exclude);
            let Ok(result) = tokio::time::timeout(remaining, poll).await else {
                warn!(polls, "Mailbox poll still running at the challenge deadline");
                return Err(SessionError::ChallengeTimeout(timeout));
            };
            match result {
                Ok(Some(challenge)) => break challenge,
                Ok(None) => debug!(polls, "Challenge email not yet arrived"),
                Err(e) if is_transient(&e) => {
                    warn!(polls, error = %e, "Mailbox poll failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() + self.timing.mail_poll_interval > deadline {
                return Err(SessionError::ChallengeTimeout(timeout));
            }
            tokio::time::sleep(self.timing.mail_poll_interval).await;
        };

        info!(message_id = %challenge.id, polls, "Challenge email correlated");

        if let ChallengePayload::Url(url) = &challenge.payload {
            let tab = self.browser.open_tab(url).await?;
            debug!(tab = %tab, host = %link_host(url), "Opened follow-up link");
            self.opened_tabs.push(tab.clone());
            self.challenge_tab = Some(tab);
        }

        self.transition(SessionState::ChallengeResolved)?;
        Ok(challenge)
    }

    /// Enter the challenge answer.
    ///
    /// For a follow-up link, the rotating code is read from the primary
    /// tab here, immediately before it is typed into the second tab.
    pub async fn submit_challenge(&mut self, payload: &ChallengePayload) -> Result<(), SessionError> {
        let primary = self.primary_tab()?;

        match payload {
            ChallengePayload::Code(code) => {
                self.browser.switch_to(&primary).await?;
                let input = self.require(&selectors::emailed_code_input()).await?;
                if let Err(e) = self.browser.fill(&input.element, code).await {
                    warn!(error = %e, "Typing the emailed code failed; assigning by script");
                    self.browser.set_value(&input.element, code).await?;
                }
                info!("Emailed code entered");
            }
            ChallengePayload::Url(_) => {
                let tab = self.challenge_tab.clone().ok_or_else(|| {
                    SessionError::PostAuthVerification("follow-up tab is not open".into())
                })?;

                self.browser.switch_to(&primary).await?;
                let code = self.read_rotating_code().await?;

                self.browser.switch_to(&tab).await?;
                let input = self.require(&selectors::verify_code_input()).await?;
                self.browser.fill(&input.element, &code).await?;

                if let Err(e) = self.click_verify_submit().await {
                    warn!(error = %e, "Submit failed; assigning code by script and retrying");
                    let input = self.require(&selectors::verify_code_input()).await?;
                    self.browser.set_value(&input.element, &code).await?;
                    self.click_verify_submit().await?;
                }
                info!(code_len = code.chars().count(), "Rotating code submitted");

                self.close_tab(&tab).await;
                self.challenge_tab = None;
                self.browser.switch_to(&primary).await?;
            }
        }
        Ok(())
    }

    /// Affirm the consent checkbox and activate the registration control.
    pub async fn confirm_device_registration(&mut self) -> Result<(), SessionError> {
        let primary = self.primary_tab()?;
        self.browser.switch_to(&primary).await?;

        let checkbox = self.require(&selectors::consent_checkbox()).await?;
        if self.browser.is_selected(&checkbox.element).await? {
            debug!("Consent already affirmed");
        } else {
            self.browser.click(&checkbox.element).await?;
        }

        tokio::time::sleep(self.timing.settle_delay).await;

        let confirm = self.require(&selectors::confirm_registration()).await?;
        self.browser.click(&confirm.element).await?;

        self.transition(SessionState::DeviceRegistered)
    }

    /// Wait for a marker only present after login.
    pub async fn await_ready(&mut self) -> Result<(), SessionError> {
        let found = resolve::wait_for_text(
            self.browser.as_ref(),
            selectors::READY_MARKERS,
            &self.timing.backoff,
        )
        .await?;

        match found {
            Some(marker) => {
                debug!(marker, "Authenticated landing state reached");
                self.transition(SessionState::Ready)
            }
            None => {
                let url = self.browser.current_url().await.unwrap_or_default();
                Err(SessionError::PostAuthVerification(format!(
                    "no post-login marker found at {url}"
                )))
            }
        }
    }

    async fn read_rotating_code(&self) -> Result<String, SessionError> {
        let chain = selectors::rotating_code();
        let element = self.require(&chain).await?;
        let code = self.browser.text(&element.element).await?.trim().to_string();
        if code.is_empty() {
            return Err(SessionError::UiElementNotFound {
                control: chain.control().to_string(),
                tried: chain.len(),
            });
        }
        Ok(code)
    }

    async fn click_verify_submit(&self) -> Result<(), SessionError> {
        let submit = self.require(&selectors::verify_submit()).await?;
        self.browser.click(&submit.element).await?;
        Ok(())
    }

    async fn require(&self, chain: &LocatorChain) -> Result<Resolved, SessionError> {
        chain
            .resolve(self.browser.as_ref(), &self.timing.backoff)
            .await?
            .ok_or_else(|| SessionError::UiElementNotFound {
                control: chain.control().to_string(),
                tried: chain.len(),
            })
    }

    fn primary_tab(&self) -> Result<TabId, SessionError> {
        self.primary
            .clone()
            .ok_or_else(|| SessionError::PostAuthVerification("primary tab unknown".into()))
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        let from = self.state.to_string();
        self.state.advance(next)?;
        info!(from = %from, to = %self.state, "Session state changed");
        Ok(())
    }

    async fn close_tab(&mut self, tab: &TabId) {
        if let Err(e) = self.browser.close_tab(tab).await {
            warn!(tab = %tab, error = %e, "Failed to close tab");
        }
        self.opened_tabs.retain(|t| t != tab);
    }

    async fn close_opened_tabs(&mut self) {
        let tabs: Vec<TabId> = self.opened_tabs.drain(..).collect();
        if tabs.is_empty() {
            return;
        }
        for tab in &tabs {
            if let Err(e) = self.browser.close_tab(tab).await {
                warn!(tab = %tab, error = %e, "Failed to close tab");
            }
        }
        self.challenge_tab = None;
        if let Some(primary) = &self.primary {
            if let Err(e) = self.browser.switch_to(primary).await {
                warn!(error = %e, "Failed to return to primary tab");
            }
        }
    }
}

/// Mailbox failures worth another poll inside the window.
fn is_transient(err: &MailError) -> bool {
    matches!(
        err,
        MailError::Connection(_) | MailError::Protocol(_) | MailError::Io(_) | MailError::Task(_)
    )
}

fn link_host(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::browser::fake::{Effect, FakeBrowser, FakeElement, FakePage};
    use crate::browser::{Backoff, Locator};
    use crate::mail::correlator::tests::{StubMailbox, config};
    use crate::mail::{BodyPart, MailMessage};

    const SENDER: &str = "info@sbisec.co.jp";
    const SUBJECT: &str = "認証コード";
    pub(crate) const LINK: &str = "https://m.sbisec.co.jp/deviceAuth?token=abc";

    pub(crate) fn timing() -> SessionTiming {
        SessionTiming {
            backoff: Backoff {
                initial: Duration::from_millis(1),
                increment: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 3,
            },
            mail_poll_interval: Duration::from_millis(5),
            challenge_timeout: Duration::from_millis(60),
            clock_skew: Duration::from_secs(30),
            settle_delay: Duration::from_millis(1),
            download_timeout: Duration::from_millis(50),
        }
    }

    pub(crate) fn css(s: &str) -> Locator {
        Locator::css(s)
    }

    pub(crate) fn login_page(next: &'static str) -> FakePage {
        FakePage::new("ログイン")
            .with(css(r#"input[name="user_id"]"#), FakeElement::visible())
            .with(css(r#"input[name="user_password"]"#), FakeElement::visible())
            .with(
                css(r#"button[name="ACT_loginHome"]"#),
                FakeElement::visible().on_click(Effect::Navigate(next)),
            )
    }

    pub(crate) fn device_page() -> FakePage {
        FakePage::new("デバイス認証")
            .with(css("#randomString"), FakeElement::visible().texts(&["AB", "CD"]))
            .with(
                css("#code-display"),
                FakeElement::visible().on_click(Effect::Navigate("device")),
            )
            .with(css(r#"input[name="device_code"]"#), FakeElement::visible())
            .with(
                css(r#"input[name="device_string_checkbox"]"#),
                FakeElement::visible().on_click(Effect::Toggle),
            )
            .with(
                Locator::button_text("デバイスを登録する"),
                FakeElement::visible().on_click(Effect::Navigate("home")),
            )
    }

    pub(crate) fn verify_page(submit: FakeElement) -> FakePage {
        FakePage::new("認証コード入力")
            .with(css(r#"input[name="verifyCode"]"#), FakeElement::visible())
            .with(css(r#"input[value="送信"]"#), submit)
    }

    pub(crate) fn portal() -> FakeBrowser {
        FakeBrowser::new()
            .page("login", login_page("device"))
            .page("device", device_page())
            .page("verify", verify_page(FakeElement::visible()))
            .page("home", FakePage::new("ようこそ ログアウト"))
            .route("ETGate", "login")
            .route("deviceAuth", "verify")
    }

    pub(crate) fn mail(body: &str) -> StubMailbox {
        StubMailbox::new(vec![(
            MailMessage {
                id: "42".into(),
                arrived_at: Utc::now(),
                body: BodyPart::Text(body.into()),
            },
            SENDER,
            SUBJECT,
        )])
    }

    pub(crate) fn credentials() -> Credentials {
        Credentials {
            user_id: "user".into(),
            password: SecretString::from("secret".to_string()),
        }
    }

    fn orchestrator(browser: Arc<FakeBrowser>, mailbox: StubMailbox) -> SessionOrchestrator {
        let correlator = MailCorrelator::new(Arc::new(mailbox), config());
        SessionOrchestrator::new(browser, correlator, "https://www.sbisec.co.jp/ETGate", timing())
    }

    fn position(events: &[String], prefix: &str) -> usize {
        events
            .iter()
            .position(|e| e.starts_with(prefix))
            .unwrap_or_else(|| panic!("no event starting with {prefix}: {events:?}"))
    }

    #[tokio::test]
    async fn link_flow_reaches_ready() {
        let browser = Arc::new(portal());
        let mut orch = orchestrator(browser.clone(), mail(&format!("以下のURLを開いてください\n{LINK}")));

        let session = orch.authenticate(&credentials()).await.unwrap();
        assert_eq!(orch.state(), &SessionState::Ready);
        assert_eq!(session.primary_tab(), &TabId("tab-0".into()));

        assert_eq!(
            browser.value_of("verify", &css(r#"input[name="verifyCode"]"#)),
            Some("AB".into())
        );
        assert_eq!(browser.open_tab_count(), 1);
    }

    #[tokio::test]
    async fn rotating_code_is_read_after_tab_opens_and_just_before_typing() {
        let browser = Arc::new(portal());
        let mut orch = orchestrator(browser.clone(), mail(LINK));
        orch.authenticate(&credentials()).await.unwrap();

        let events = browser.events();
        let opened = position(&events, "open_tab:");
        let read = position(&events, "read:css=#randomString");
        let typed = position(&events, r#"fill:css=input[name="verifyCode"]"#);
        assert!(opened < read && read < typed, "{events:?}");
        assert_eq!(
            events.iter().filter(|e| e.starts_with("read:css=#randomString")).count(),
            1
        );
    }

    #[tokio::test]
    async fn code_flow_fills_primary_tab() {
        let browser = Arc::new(portal());
        let mut orch = orchestrator(browser.clone(), mail("■認証コード\nZX9Y8W\n"));

        orch.authenticate(&credentials()).await.unwrap();
        assert_eq!(
            browser.value_of("device", &css(r#"input[name="device_code"]"#)),
            Some("ZX9Y8W".into())
        );
        assert!(!browser.events().iter().any(|e| e.starts_with("open_tab:")));
    }

    #[tokio::test]
    async fn submit_falls_back_to_scripted_value() {
        let browser = Arc::new(
            portal().page("verify", verify_page(FakeElement::visible().failing_clicks(1))),
        );
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        orch.authenticate(&credentials()).await.unwrap();
        let events = browser.events();
        let failed = position(&events, "click-failed:");
        let scripted = position(&events, r#"set_value:css=input[name="verifyCode"]=AB"#);
        assert!(failed < scripted);
    }

    #[tokio::test]
    async fn consent_already_affirmed_is_not_toggled() {
        let device = FakePage::new("デバイス認証")
            .with(css("#randomString"), FakeElement::visible().texts(&["AB"]))
            .with(css("#code-display"), FakeElement::visible())
            .with(
                css(r#"input[name="device_string_checkbox"]"#),
                FakeElement::visible().checked().on_click(Effect::Toggle),
            )
            .with(
                Locator::button_text("デバイスを登録する"),
                FakeElement::visible().on_click(Effect::Navigate("home")),
            );
        let browser = Arc::new(portal().page("device", device));
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        orch.authenticate(&credentials()).await.unwrap();
        assert!(
            !browser
                .events()
                .iter()
                .any(|e| e == r#"click:css=input[name="device_string_checkbox"]"#)
        );
    }

    #[tokio::test]
    async fn wrong_credentials_fail_with_auth() {
        let browser = Arc::new(
            portal()
                .page("login", login_page("login-error"))
                .page(
                    "login-error",
                    FakePage::new("ユーザーネームまたはパスワードが違います"),
                ),
        );
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        assert_eq!(orch.state(), &SessionState::Failed("auth".into()));
    }

    #[tokio::test]
    async fn missing_challenge_affordance_is_ui_element_not_found() {
        let browser = Arc::new(
            portal()
                .page("login", login_page("bare"))
                .page("bare", FakePage::new("デバイス認証")),
        );
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(
            matches!(&err, SessionError::UiElementNotFound { control, tried } if control == "send challenge" && *tried == 4)
        );
        assert_eq!(orch.state(), &SessionState::Failed("ui_element_not_found".into()));
    }

    #[tokio::test]
    async fn no_mail_times_out() {
        let browser = Arc::new(portal());
        let mut orch = orchestrator(browser.clone(), StubMailbox::new(vec![]));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::ChallengeTimeout(_)));
        assert_eq!(orch.state(), &SessionState::Failed("challenge_timeout".into()));
    }

    /// A mailbox whose searches hang far beyond the challenge window.
    /// Mailbox whose searches outlast any challenge window used in tests.
    pub(crate) struct HangingMailbox;

    #[async_trait::async_trait]
    impl crate::mail::Mailbox for HangingMailbox {
        async fn search(&self, _filter: &crate::mail::SearchFilter) -> Result<Vec<String>, MailError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Vec::new())
        }

        async fn fetch(&self, id: &str) -> Result<MailMessage, MailError> {
            Err(MailError::UnparseableMessage { id: id.to_string() })
        }
    }

    #[tokio::test]
    async fn hanging_mailbox_is_cut_off_at_the_deadline() {
        let browser = Arc::new(portal());
        let correlator = MailCorrelator::new(Arc::new(HangingMailbox), config());
        let mut orch =
            SessionOrchestrator::new(browser, correlator, "https://www.sbisec.co.jp/ETGate", timing());

        let started = std::time::Instant::now();
        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::ChallengeTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn unreadable_challenge_mail_is_payload_extraction() {
        let browser = Arc::new(portal());
        let mut orch = orchestrator(browser.clone(), mail("本文が空です"));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::PayloadExtraction { .. }));
    }

    #[tokio::test]
    async fn second_tab_closed_when_submission_fails() {
        let browser = Arc::new(portal().page("verify", FakePage::new("エラー")));
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::UiElementNotFound { .. }));
        assert_eq!(browser.open_tab_count(), 1);
        assert!(browser.events().iter().any(|e| e == "close:tab-1"));
    }

    #[tokio::test]
    async fn missing_landing_marker_is_post_auth_failure() {
        let browser = Arc::new(portal().page("home", FakePage::new("処理中")));
        let mut orch = orchestrator(browser.clone(), mail(LINK));

        let err = orch.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, SessionError::PostAuthVerification(_)));
        assert_eq!(orch.state(), &SessionState::Failed("post_auth_verification".into()));
    }

    #[test]
    fn transient_mail_errors() {
        assert!(is_transient(&MailError::Connection("reset".into())));
        assert!(!is_transient(&MailError::PayloadExtraction { id: "1".into() }));
        assert!(!is_transient(&MailError::LoginRejected {
            username: "u".into()
        }));
    }

    #[test]
    fn link_host_strips_token() {
        assert_eq!(link_host(LINK), "m.sbisec.co.jp");
        assert_eq!(link_host("not a url"), "");
    }
}
