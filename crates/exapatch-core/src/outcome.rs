use serde::Serialize;

use crate::error::{NO_ACTION_REQUIRED_CODE, PatchError, SUCCESS_CODE};

/// Final result of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Success,
    /// Every selected node was already in the requested state.
    NoActionRequired,
    Failure(PatchError),
}

impl PatchOutcome {
    /// Hexadecimal return code.
    pub fn code(&self) -> &str {
        match self {
            Self::Success => SUCCESS_CODE,
            Self::NoActionRequired => NO_ACTION_REQUIRED_CODE,
            Self::Failure(e) => e.code.hex(),
        }
    }

    pub fn no_action_taken(&self) -> bool {
        matches!(self, Self::NoActionRequired)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Serializable `(code, no_action_taken)` view for callers.
    pub fn report(&self) -> OutcomeReport {
        let (message, suggestion) = match self {
            Self::Failure(e) => (Some(e.message.clone()), Some(e.suggestion.clone())),
            _ => (None, None),
        };
        OutcomeReport {
            code: self.code().to_string(),
            no_action_taken: self.no_action_taken(),
            message,
            suggestion,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    pub code: String,
    pub no_action_taken: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}
