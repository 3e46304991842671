use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;
use crate::token::TokenError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid token: {0}")]
    TokenInvalid(&'static str),
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenConsumed,
    #[error("reschedule limit of {0} reached")]
    RescheduleBudgetExhausted(u32),
    #[error("booking {0} is canceled")]
    BookingAlreadyTerminal(Ulid),
    #[error("slot no longer available")]
    SlotConflict,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: Ms },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// HTTP-style status for the error class.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => 400,
            EngineError::TokenInvalid(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::SlotConflict => 409,
            EngineError::TokenExpired
            | EngineError::TokenConsumed
            | EngineError::RescheduleBudgetExhausted(_)
            | EngineError::BookingAlreadyTerminal(_) => 410,
            EngineError::RateLimited { .. } => 429,
            EngineError::WalError(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SlotConflict | EngineError::RateLimited { .. })
    }

    pub fn sqlstate(&self) -> &'static str {
        match self.status() {
            400 => "22023",
            403 => "42501",
            404 => "P0002",
            409 => "40001",
            410 => "55000",
            429 => "53400",
            _ => "58030",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

impl From<TokenError> for EngineError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Malformed => EngineError::TokenInvalid("malformed"),
            TokenError::BadSignature => EngineError::TokenInvalid("bad signature"),
            TokenError::Expired => EngineError::TokenExpired,
        }
    }
}
