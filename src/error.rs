use serde::Serialize;

/// Caller-facing failures of the pairing, presence and call components.
///
/// Delivery failures (dead connection, rejected push token) are not part of
/// this enum: they are logged where they happen and never reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("code expired")]
    Expired,

    #[error("an elder device named {0:?} is already in this room")]
    DuplicateDisplayName(String),

    #[error("requester is not a recognized family account")]
    IdentityInvalid,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Short machine-readable tag sent in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Expired,
    Conflict,
    Unauthorized,
    Internal,
}

impl SignalError {
    pub fn missing(field: &str) -> Self {
        Self::Validation(format!("missing field {field}"))
    }

    pub fn code(&self) -> ErrorCode {
        use SignalError::*;
        match self {
            Validation(_) => ErrorCode::Validation,
            NotFound(_) => ErrorCode::NotFound,
            Expired => ErrorCode::Expired,
            DuplicateDisplayName(_) | Conflict(_) => ErrorCode::Conflict,
            IdentityInvalid | Unauthorized(_) => ErrorCode::Unauthorized,
            Store(_) => ErrorCode::Internal,
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
