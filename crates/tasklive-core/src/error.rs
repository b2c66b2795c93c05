use thiserror::Error;

/// Why a request against the task service did not succeed.
///
/// Every variant takes the same rollback path in the optimistic
/// applier; the kind only changes what the user is told.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestFailure {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RequestFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestFailure::Transport(_) => "transport",
            RequestFailure::Validation(_) => "validation",
            RequestFailure::NotFound(_) => "not_found",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RequestFailure::Transport(reason)
            | RequestFailure::Validation(reason)
            | RequestFailure::NotFound(reason) => reason,
        }
    }
}
