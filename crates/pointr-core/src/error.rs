// Error types shared by the store, the voting state machine and the
// client adapter.

use thiserror::Error;

use crate::model::EntityKind;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Input the user can fix locally. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("A story titled \"{title}\" already exists.")]
    DuplicateTitle { title: String },

    #[error("The name \"{name}\" is already taken. How about \"{suggestion}\"?")]
    NameTaken { name: String, suggestion: String },

    #[error("Please enter a valid {field}.")]
    EmptyInput { field: &'static str },

    #[error("{points} is not a valid estimate.")]
    InvalidPoints { points: u32 },

    #[error("No voting round is in progress.")]
    NotVoting,

    #[error("Waiting on votes: {voted} of {participants} participants have voted.")]
    RoundIncomplete { voted: usize, participants: usize },

    #[error("Join the session before voting.")]
    NotJoined,

    #[error("Pick an estimate before submitting.")]
    NoSelection,
}

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// The three failure categories a session operation can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Transport,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },

    #[error("store unavailable: {message}")]
    Transport { message: String },
}

impl SessionError {
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        SessionError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        SessionError::Transport {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Validation(_) => ErrorCategory::Validation,
            SessionError::NotFound { .. } => ErrorCategory::NotFound,
            SessionError::Transport { .. } => ErrorCategory::Transport,
        }
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            SessionError::Validation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::transport(e.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
