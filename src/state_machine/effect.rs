//! Effects produced by state transitions

use super::state::{ExchangeId, ExchangeOutcome};

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    // Log mutations, applied by the reducer in order
    AppendUserMessage {
        content: Option<String>,
        image_ref: Option<String>,
    },
    /// Start the in-progress assistant message
    BeginAssistantMessage,
    AppendDelta {
        text: String,
    },
    FinalizeAssistantMessage,
    /// Append a complete assistant message in one step
    AppendAssistantMessage {
        content: String,
    },

    /// Hand a snapshot of the finalized log to the store
    PersistSnapshot,

    /// Open the downstream request
    RequestLlm { exchange: ExchangeId },

    /// Tear down the in-flight request
    AbortLlm { exchange: ExchangeId },

    /// Report how the exchange ended
    NotifyOutcome {
        exchange: ExchangeId,
        outcome: ExchangeOutcome,
    },
}

impl Effect {
    /// Whether this effect mutates the message log
    pub fn is_log_mutation(&self) -> bool {
        matches!(
            self,
            Effect::AppendUserMessage { .. }
                | Effect::BeginAssistantMessage
                | Effect::AppendDelta { .. }
                | Effect::FinalizeAssistantMessage
                | Effect::AppendAssistantMessage { .. }
        )
    }

    pub fn outcome(exchange: ExchangeId, outcome: ExchangeOutcome) -> Self {
        Effect::NotifyOutcome { exchange, outcome }
    }
}
