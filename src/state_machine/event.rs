//! Events that can occur in a conversation

use super::state::ExchangeId;
use crate::error::ExchangeError;

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User events
    UserMessage {
        content: Option<String>,
        image_ref: Option<String>,
        /// Id the exchange will carry if accepted
        exchange: ExchangeId,
    },
    UserCancel,

    // Response events
    Delta {
        exchange: ExchangeId,
        text: String,
    },
    StreamEnd {
        exchange: ExchangeId,
    },
    /// Full answer from the non-streaming path
    Response {
        exchange: ExchangeId,
        content: String,
    },
    StreamError {
        exchange: ExchangeId,
        error: ExchangeError,
    },

    // Policy events
    Timeout {
        exchange: ExchangeId,
    },
}

impl Event {
    /// Exchange a response or policy event belongs to
    pub fn response_exchange(&self) -> Option<ExchangeId> {
        match self {
            Event::UserMessage { .. } | Event::UserCancel => None,
            Event::Delta { exchange, .. }
            | Event::StreamEnd { exchange }
            | Event::Response { exchange, .. }
            | Event::StreamError { exchange, .. }
            | Event::Timeout { exchange } => Some(*exchange),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::UserMessage { .. } => "user_message",
            Event::UserCancel => "user_cancel",
            Event::Delta { .. } => "delta",
            Event::StreamEnd { .. } => "stream_end",
            Event::Response { .. } => "response",
            Event::StreamError { .. } => "stream_error",
            Event::Timeout { .. } => "timeout",
        }
    }
}
