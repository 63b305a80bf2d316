//! Portal authentication: state machine, control selectors, orchestrator.

pub mod orchestrator;
pub mod selectors;
pub mod state;

pub use orchestrator::{AuthenticatedSession, Credentials, SessionOrchestrator};
pub use state::SessionState;
