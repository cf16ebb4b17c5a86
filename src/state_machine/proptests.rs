//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across arbitrary event sequences.

use super::*;
use crate::error::ExchangeError;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new("test-conv", "user-1", "test-model")
}

/// Small id space so generated events often hit the current exchange
fn arb_exchange() -> impl Strategy<Value = ExchangeId> {
    (0u64..3).prop_map(ExchangeId)
}

fn arb_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        Just(ConvState::Idle),
        arb_exchange().prop_map(|exchange| ConvState::AwaitingResponse { exchange }),
        arb_exchange().prop_map(|exchange| ConvState::Streaming { exchange }),
    ]
}

fn arb_busy_state() -> impl Strategy<Value = ConvState> {
    prop_oneof![
        arb_exchange().prop_map(|exchange| ConvState::AwaitingResponse { exchange }),
        arb_exchange().prop_map(|exchange| ConvState::Streaming { exchange }),
    ]
}

fn arb_error() -> impl Strategy<Value = ExchangeError> {
    prop_oneof![
        "[a-z ]{1,20}".prop_map(ExchangeError::network),
        "[a-z ]{1,20}".prop_map(ExchangeError::decode),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        (proptest::option::of("[a-zA-Z ]{0,10}"), arb_exchange()).prop_map(|(content, exchange)| {
            Event::UserMessage {
                content,
                image_ref: None,
                exchange,
            }
        }),
        Just(Event::UserCancel),
        (arb_exchange(), "[a-z ]{0,5}").prop_map(|(exchange, text)| Event::Delta { exchange, text }),
        arb_exchange().prop_map(|exchange| Event::StreamEnd { exchange }),
        (arb_exchange(), "[a-z ]{0,10}").prop_map(|(exchange, content)| Event::Response { exchange, content }),
        (arb_exchange(), arb_error()).prop_map(|(exchange, error)| Event::StreamError { exchange, error }),
        arb_exchange().prop_map(|exchange| Event::Timeout { exchange }),
    ]
}

/// Tracks the message log shape implied by the effects emitted so far
#[derive(Debug, Default)]
struct LogModel {
    messages: usize,
    in_progress: bool,
}

impl LogModel {
    fn apply(&mut self, effect: &Effect) -> Result<(), String> {
        match effect {
            Effect::AppendUserMessage { .. } | Effect::AppendAssistantMessage { .. } => {
                if self.in_progress {
                    return Err(format!("{effect:?} while a message is in progress"));
                }
                self.messages += 1;
            }
            Effect::BeginAssistantMessage => {
                if self.in_progress {
                    return Err("two in-progress messages".to_string());
                }
                self.messages += 1;
                self.in_progress = true;
            }
            Effect::AppendDelta { .. } => {
                if !self.in_progress {
                    return Err("delta with no in-progress message".to_string());
                }
            }
            Effect::FinalizeAssistantMessage => {
                if !self.in_progress {
                    return Err("finalize with no in-progress message".to_string());
                }
                self.in_progress = false;
            }
            Effect::PersistSnapshot
            | Effect::RequestLlm { .. }
            | Effect::AbortLlm { .. }
            | Effect::NotifyOutcome { .. } => {}
        }
        Ok(())
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Any event sequence keeps the log consistent with the state
    #[test]
    fn prop_log_matches_state(events in proptest::collection::vec(arb_event(), 0..40)) {
        let context = test_context();
        let mut state = ConvState::Idle;
        let mut log = LogModel::default();

        for event in events {
            if let Ok(result) = transition(&state, &context, event) {
                for effect in &result.effects {
                    log.apply(effect).map_err(TestCaseError::fail)?;
                }
                state = result.new_state;
            }
            // Only Streaming has an in-progress message
            prop_assert_eq!(log.in_progress, matches!(state, ConvState::Streaming { .. }));
        }
    }

    /// Busy states reject new messages
    #[test]
    fn prop_busy_rejects_messages(state in arb_busy_state(), text in "[a-zA-Z]{1,20}", exchange in arb_exchange()) {
        let event = Event::UserMessage { content: Some(text), image_ref: None, exchange };
        let result = transition(&state, &test_context(), event);
        prop_assert_eq!(result.unwrap_err(), TransitionError::Busy);
    }

    /// Events tagged with another exchange never change anything
    #[test]
    fn prop_stale_events_are_noops(state in arb_state(), event in arb_event()) {
        let Some(exchange) = event.response_exchange() else {
            return Ok(());
        };
        prop_assume!(state.exchange() != Some(exchange));

        let result = transition(&state, &test_context(), event).unwrap();
        prop_assert_eq!(result.new_state, state);
        prop_assert!(result.is_noop());
    }

    /// Cancel always returns to Idle and tears down the request
    #[test]
    fn prop_cancel_stops_work(state in arb_busy_state()) {
        let result = transition(&state, &test_context(), Event::UserCancel).unwrap();
        prop_assert_eq!(result.new_state, ConvState::Idle);
        let exchange = state.exchange().unwrap();
        let aborts = result.effects.contains(&Effect::AbortLlm { exchange });
        prop_assert!(aborts, "abort effect missing");
    }

    /// Every transition back to Idle reports exactly one outcome
    #[test]
    fn prop_idle_reached_with_one_outcome(state in arb_busy_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, &test_context(), event) {
            let outcomes = result
                .effects
                .iter()
                .filter(|e| matches!(e, Effect::NotifyOutcome { .. }))
                .count();
            let expected = usize::from(result.new_state == ConvState::Idle);
            prop_assert_eq!(outcomes, expected);
        }
    }

    /// Idle accepts any non-blank message
    #[test]
    fn prop_idle_accepts_messages(text in "[a-zA-Z][a-zA-Z ]{0,29}", exchange in arb_exchange()) {
        let event = Event::UserMessage { content: Some(text), image_ref: None, exchange };
        let result = transition(&ConvState::Idle, &test_context(), event).unwrap();
        prop_assert_eq!(result.new_state, ConvState::AwaitingResponse { exchange });
        let requests = result.effects.contains(&Effect::RequestLlm { exchange });
        prop_assert!(requests, "request effect missing");
    }
}
