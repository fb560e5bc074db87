use thiserror::Error;
use uuid::Uuid;

use crate::session::TerminalAction;

#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("session not found: {0}")]
    NotFound(Uuid),

    #[error("correlation window elapsed for session {0}")]
    CorrelationTimeout(Uuid),

    #[error("terminal action already pending: {0}")]
    ActionConflict(TerminalAction),

    #[error("no configuration mapped for number {0}")]
    NotConfigured(String),

    #[error("{collaborator} call failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("invalid tool arguments: {0}")]
    InvalidToolArgs(String),

    #[error("session invariant violated: {0}")]
    InvariantViolation(String),
}

impl SwitchboardError {
    pub fn collaborator(name: &'static str, err: impl std::fmt::Display) -> Self {
        SwitchboardError::Collaborator {
            collaborator: name,
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for SwitchboardError {
    fn from(e: sqlx::Error) -> Self {
        SwitchboardError::StoreUnavailable(e.to_string())
    }
}
