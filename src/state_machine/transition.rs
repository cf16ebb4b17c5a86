//! Pure state transition function
//!
//! Given the same inputs it always produces the same outputs, with no I/O.

use super::{ConvContext, ConvState, Effect, Event, ExchangeId, ExchangeOutcome};
use crate::error::ExchangeErrorKind;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// Nothing happened; observers are not notified
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("A response is already being generated (cancel it first)")]
    Busy,
    #[error("Message has neither text nor image")]
    EmptyMessage,
    #[error("No API credential configured")]
    ConfigurationMissing,
    #[error("Nothing to cancel")]
    NothingToCancel,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

impl TransitionError {
    /// Error classification for rejections the user should see
    pub fn kind(&self) -> Option<ExchangeErrorKind> {
        match self {
            TransitionError::Busy => Some(ExchangeErrorKind::Busy),
            TransitionError::ConfigurationMissing => Some(ExchangeErrorKind::ConfigurationMissing),
            TransitionError::EmptyMessage
            | TransitionError::NothingToCancel
            | TransitionError::InvalidTransition(_) => None,
        }
    }
}

/// Pure transition function
pub fn transition(
    state: &ConvState,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    // Events from an exchange that is no longer current (cancelled, timed
    // out, or already finished) are dropped without touching anything.
    if let Some(exchange) = event.response_exchange() {
        if state.exchange() != Some(exchange) {
            return Ok(TransitionResult::new(*state));
        }
    }

    match (*state, event) {
        // ============================================================
        // User Message Handling
        // ============================================================

        (
            ConvState::Idle,
            Event::UserMessage {
                content,
                image_ref,
                exchange,
            },
        ) => {
            let content = content.filter(|text| !text.trim().is_empty());
            let image_ref = image_ref.filter(|url| !url.trim().is_empty());
            if content.is_none() && image_ref.is_none() {
                return Err(TransitionError::EmptyMessage);
            }
            if !context.has_credential {
                return Err(TransitionError::ConfigurationMissing);
            }

            Ok(
                TransitionResult::new(ConvState::AwaitingResponse { exchange })
                    .with_effect(Effect::AppendUserMessage { content, image_ref })
                    .with_effect(Effect::PersistSnapshot)
                    .with_effect(Effect::RequestLlm { exchange }),
            )
        }

        // At most one outstanding exchange; never queued
        (ConvState::AwaitingResponse { .. } | ConvState::Streaming { .. }, Event::UserMessage { .. }) => {
            Err(TransitionError::Busy)
        }

        // ============================================================
        // Streaming
        // ============================================================

        (ConvState::AwaitingResponse { .. } | ConvState::Streaming { .. }, Event::Delta { text, .. })
            if text.is_empty() =>
        {
            Ok(TransitionResult::new(*state))
        }

        // First delta opens the assistant message
        (ConvState::AwaitingResponse { exchange }, Event::Delta { text, .. }) => {
            Ok(TransitionResult::new(ConvState::Streaming { exchange })
                .with_effect(Effect::BeginAssistantMessage)
                .with_effect(Effect::AppendDelta { text }))
        }

        (ConvState::Streaming { .. }, Event::Delta { text, .. }) => {
            Ok(TransitionResult::new(*state).with_effect(Effect::AppendDelta { text }))
        }

        // Zero deltas: an empty assistant message keeps the log consistent
        (ConvState::AwaitingResponse { exchange }, Event::StreamEnd { .. }) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::AppendAssistantMessage {
                    content: String::new(),
                })
                .with_effects(finish(exchange, ExchangeOutcome::Completed)))
        }

        (ConvState::Streaming { exchange }, Event::StreamEnd { .. }) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::FinalizeAssistantMessage)
                .with_effects(finish(exchange, ExchangeOutcome::Completed)))
        }

        // ============================================================
        // Non-streaming fallback
        // ============================================================

        (ConvState::AwaitingResponse { exchange }, Event::Response { content, .. }) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::AppendAssistantMessage { content })
                .with_effects(finish(exchange, ExchangeOutcome::Completed)))
        }

        // ============================================================
        // Errors
        // ============================================================

        // Nothing was generated: keep the user message, add nothing
        (ConvState::AwaitingResponse { exchange }, Event::StreamError { error, .. }) => {
            Ok(TransitionResult::new(ConvState::Idle).with_effect(Effect::outcome(
                exchange,
                ExchangeOutcome::Failed {
                    error,
                    partial_kept: false,
                },
            )))
        }

        // Mid-stream failure keeps the partial answer, as cancellation does
        (ConvState::Streaming { exchange }, Event::StreamError { error, .. }) => {
            Ok(TransitionResult::new(ConvState::Idle)
                .with_effect(Effect::FinalizeAssistantMessage)
                .with_effects(finish(
                    exchange,
                    ExchangeOutcome::Failed {
                        error,
                        partial_kept: true,
                    },
                )))
        }

        // ============================================================
        // Cancellation and timeout
        // ============================================================

        (ConvState::AwaitingResponse { exchange }, Event::UserCancel) => Ok(abort_before_first_delta(
            exchange,
            ExchangeOutcome::Cancelled {
                partial_kept: false,
            },
        )),

        (ConvState::AwaitingResponse { exchange }, Event::Timeout { .. }) => Ok(abort_before_first_delta(
            exchange,
            ExchangeOutcome::TimedOut {
                partial_kept: false,
            },
        )),

        (ConvState::Streaming { exchange }, Event::UserCancel) => Ok(abort_mid_stream(
            exchange,
            ExchangeOutcome::Cancelled { partial_kept: true },
        )),

        (ConvState::Streaming { exchange }, Event::Timeout { .. }) => Ok(abort_mid_stream(
            exchange,
            ExchangeOutcome::TimedOut { partial_kept: true },
        )),

        (ConvState::Idle, Event::UserCancel) => Err(TransitionError::NothingToCancel),

        // ============================================================
        // Invalid Transitions
        // ============================================================

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {} with event {}",
            state.name(),
            event.name()
        ))),
    }
}

// Helper functions

/// Closing effects of every exchange that reached the log
fn finish(exchange: ExchangeId, outcome: ExchangeOutcome) -> [Effect; 2] {
    [Effect::PersistSnapshot, Effect::outcome(exchange, outcome)]
}

fn abort_before_first_delta(exchange: ExchangeId, outcome: ExchangeOutcome) -> TransitionResult {
    TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::AbortLlm { exchange })
        .with_effect(Effect::outcome(exchange, outcome))
}

fn abort_mid_stream(exchange: ExchangeId, outcome: ExchangeOutcome) -> TransitionResult {
    TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::AbortLlm { exchange })
        .with_effect(Effect::FinalizeAssistantMessage)
        .with_effects(finish(exchange, outcome))
}
