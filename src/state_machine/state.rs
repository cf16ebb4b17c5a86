//! Conversation state types

use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one request/response exchange within a conversation.
///
/// Every event coming back from the network is tagged with the exchange
/// that produced it; events for any other exchange are stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input
    #[default]
    Idle,

    /// Request sent, no delta received yet
    AwaitingResponse { exchange: ExchangeId },

    /// At least one delta applied; the last message is in progress
    Streaming { exchange: ExchangeId },
}

impl ConvState {
    /// Whether a response is being generated
    pub fn is_busy(&self) -> bool {
        !matches!(self, ConvState::Idle)
    }

    /// The in-flight exchange, if any
    pub fn exchange(&self) -> Option<ExchangeId> {
        match self {
            ConvState::Idle => None,
            ConvState::AwaitingResponse { exchange } | ConvState::Streaming { exchange } => {
                Some(*exchange)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Idle => "idle",
            ConvState::AwaitingResponse { .. } => "awaiting_response",
            ConvState::Streaming { .. } => "streaming",
        }
    }
}

/// How an exchange ended, as reported to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Completed,
    /// Stopped by the user
    Cancelled { partial_kept: bool },
    /// Stopped by the caller-supplied deadline
    TimedOut { partial_kept: bool },
    Failed {
        error: ExchangeError,
        partial_kept: bool,
    },
}

impl ExchangeOutcome {
    /// "Exchange failed, retry available"
    pub fn retry_available(&self) -> bool {
        match self {
            ExchangeOutcome::Failed { error, .. } => error.is_retryable(),
            ExchangeOutcome::TimedOut { .. } => true,
            ExchangeOutcome::Completed | ExchangeOutcome::Cancelled { .. } => false,
        }
    }

    /// Whether partial assistant output was kept in the log
    pub fn partial_kept(&self) -> bool {
        match self {
            ExchangeOutcome::Completed => false,
            ExchangeOutcome::Cancelled { partial_kept }
            | ExchangeOutcome::TimedOut { partial_kept }
            | ExchangeOutcome::Failed { partial_kept, .. } => *partial_kept,
        }
    }
}

/// Context for a conversation (immutable configuration)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    /// Caller identity attached to outbound requests
    pub owner_id: String,
    pub model_id: String,
    /// Whether a provider credential is available
    pub has_credential: bool,
}

impl ConvContext {
    pub fn new(
        conversation_id: impl Into<String>,
        owner_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            owner_id: owner_id.into(),
            model_id: model_id.into(),
            has_credential: true,
        }
    }

    #[must_use]
    pub fn with_credential(mut self, has_credential: bool) -> Self {
        self.has_credential = has_credential;
        self
    }
}
