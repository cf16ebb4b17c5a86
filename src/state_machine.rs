//! Core conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! `transition(state, context, event)` returns the next state plus the
//! effects to perform. Log effects are applied by the reducer, the rest
//! are executed by the runtime.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::Event;
pub use state::{ConvContext, ConvState, ExchangeId, ExchangeOutcome};
pub use transition::{transition, TransitionError};
