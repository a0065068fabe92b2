use serde::Serialize;
use uuid::Uuid;

/// Coarse classification reported to clients alongside the specific code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Permission,
    State,
    Transport,
}

/// Every way a client-initiated mutation or query can be rejected.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("content too long: {actual} > {limit}")]
    ContentTooLong { limit: usize, actual: usize },

    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("poll not found: {0}")]
    PollNotFound(Uuid),
    #[error("option not found: {0}")]
    OptionNotFound(Uuid),

    #[error("only the poll creator may {0} it")]
    NotOwner(&'static str),
    #[error("identity mismatch: payload names {0}")]
    IdentityMismatch(String),
    #[error("a connection may create at most {0} rooms")]
    RoomLimit(usize),

    #[error("poll is closed")]
    PollClosed,
    #[error("poll already closed")]
    AlreadyClosed,

    #[error("transport: {0}")]
    Transport(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::ContentTooLong { .. } => ErrorKind::Validation,
            Self::RoomNotFound(_) | Self::PollNotFound(_) | Self::OptionNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NotOwner(_) | Self::IdentityMismatch(_) | Self::RoomLimit(_) => {
                ErrorKind::Permission
            }
            Self::PollClosed | Self::AlreadyClosed => ErrorKind::State,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Stable machine-readable code for the error frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_payload",
            Self::ContentTooLong { .. } => "content_too_long",
            Self::RoomNotFound(_) => "room_not_found",
            Self::PollNotFound(_) => "poll_not_found",
            Self::OptionNotFound(_) => "option_not_found",
            Self::NotOwner(_) => "not_owner",
            Self::IdentityMismatch(_) => "identity_mismatch",
            Self::RoomLimit(_) => "room_limit",
            Self::PollClosed => "poll_closed",
            Self::AlreadyClosed => "already_closed",
            Self::Transport(_) => "transport",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
