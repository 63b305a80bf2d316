//! Session state machine: tracks how far authentication has progressed.

use serde::Serialize;

use crate::error::SessionError;

/// The states of one authentication attempt.
///
/// Progresses linearly: Unauthenticated → CredentialsSubmitted →
/// ChallengeTriggered → ChallengeResolved → DeviceRegistered → Ready.
/// Any non-terminal state may move to `Failed`. No state is revisited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unauthenticated,
    CredentialsSubmitted,
    ChallengeTriggered,
    ChallengeResolved,
    DeviceRegistered,
    Ready,
    Failed(String),
}

impl SessionState {
    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Live states may fail at any point; otherwise only the next state on
    /// the success path is reachable.
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(target, SessionState::Failed(_)) || self.next().as_ref() == Some(target)
    }

    /// Whether this state ends the attempt.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }

    /// The next state on the success path, if any.
    fn next(&self) -> Option<SessionState> {
        use SessionState::*;
        match self {
            Unauthenticated => Some(CredentialsSubmitted),
            CredentialsSubmitted => Some(ChallengeTriggered),
            ChallengeTriggered => Some(ChallengeResolved),
            ChallengeResolved => Some(DeviceRegistered),
            DeviceRegistered => Some(Ready),
            Ready | Failed(_) => None,
        }
    }

    /// Move to `target`, rejecting anything but a forward step.
    pub fn advance(&mut self, target: SessionState) -> Result<(), SessionError> {
        if !self.can_transition_to(&target) {
            return Err(SessionError::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::CredentialsSubmitted => "credentials_submitted",
            Self::ChallengeTriggered => "challenge_triggered",
            Self::ChallengeResolved => "challenge_resolved",
            Self::DeviceRegistered => "device_registered",
            Self::Ready => "ready",
            Self::Failed(reason) => return write!(f, "failed({reason})"),
        };
        write!(f, "{s}")
    }
}
