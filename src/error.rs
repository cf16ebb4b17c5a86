//! Exchange error types
//!
//! Errors at the boundary between the request/stream layer and the
//! conversation state machine. Provider-level detail lives in
//! [`crate::llm::LlmError`]; this is what observers get to see.

use crate::llm::{LlmError, LlmErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed exchange, classified for user-visible reporting
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExchangeError {
    pub kind: ExchangeErrorKind,
    pub message: String,
    /// Whether sending the same message again can succeed
    pub retryable: bool,
}

impl ExchangeError {
    pub fn new(kind: ExchangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    /// A request the provider rejected for good; resending will not help
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::network(message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ExchangeErrorKind::NetworkFailure, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ExchangeErrorKind::DecodeFailure, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<LlmError> for ExchangeError {
    fn from(e: LlmError) -> Self {
        match e.kind {
            // A refused key is as unusable as a missing one
            LlmErrorKind::Configuration | LlmErrorKind::Auth => {
                Self::new(ExchangeErrorKind::ConfigurationMissing, e.message)
            }
            kind if kind.is_retryable() => Self::network(e.message),
            LlmErrorKind::Network
            | LlmErrorKind::RateLimit
            | LlmErrorKind::ServerError
            | LlmErrorKind::InvalidRequest
            | LlmErrorKind::Unknown => Self::rejected(e.message),
        }
    }
}

/// Error classification for UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeErrorKind {
    /// No credential available; nothing was sent
    ConfigurationMissing,
    /// Request could not be opened or was rejected - retryable
    NetworkFailure,
    /// Stream broke mid-response; partial content is kept
    DecodeFailure,
    /// A single unparseable frame; absorbed by the decoder
    MalformedFrame,
    /// A submission arrived while an exchange was in flight
    Busy,
}

impl ExchangeErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkFailure | Self::DecodeFailure)
    }
}
