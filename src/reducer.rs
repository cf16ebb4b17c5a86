//! Conversation reducer
//!
//! Owns one conversation's message log and state. Every accepted event goes
//! through the pure [`transition`] function; log effects are applied here,
//! synchronously, and each transition produces exactly one
//! [`ConversationUpdate`] carrying the changes together with the freshly
//! recomputed preview. I/O effects are handed back to the caller.

use crate::conversation::{Conversation, Message};
use crate::error::ExchangeError;
use crate::state_machine::{
    transition, ConvContext, ConvState, Effect, Event, ExchangeId, ExchangeOutcome, TransitionError,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered updates per subscriber before it starts lagging
pub const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// One change to the message log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    MessageAppended { index: usize, message: Message },
    DeltaApplied { index: usize, text: String },
    MessageFinalized { index: usize },
}

/// Everything observers need after one transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationUpdate {
    /// Position in this conversation's update sequence, starting at 1
    pub seq: u64,
    pub changes: Vec<Change>,
    pub state: ConvState,
    pub preview: String,
    /// The activity flag
    pub generating: bool,
    /// Set when this transition ended an exchange
    pub outcome: Option<ExchangeOutcome>,
}

/// The log as it stood after update `seq`
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub seq: u64,
    pub conversation: Conversation,
}

/// Single-threaded state machine over one conversation
pub struct ConversationReducer {
    context: ConvContext,
    state: ConvState,
    conversation: Conversation,
    last_exchange: u64,
    seq: u64,
    updates: broadcast::Sender<ConversationUpdate>,
}

impl ConversationReducer {
    pub fn new(context: ConvContext, conversation: Conversation) -> Self {
        Self::with_update_capacity(context, conversation, UPDATE_CHANNEL_CAPACITY)
    }

    pub fn with_update_capacity(context: ConvContext, conversation: Conversation, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        Self {
            context,
            state: ConvState::Idle,
            conversation,
            last_exchange: 0,
            seq: 0,
            updates,
        }
    }

    pub fn context(&self) -> &ConvContext {
        &self.context
    }

    pub fn state(&self) -> ConvState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Current log, stamped with the last update it reflects
    pub fn view(&self) -> ConversationView {
        ConversationView {
            seq: self.seq,
            conversation: self.conversation.clone(),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.state.is_busy()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }

    /// Sender half, for handles that subscribe later
    pub fn update_sender(&self) -> broadcast::Sender<ConversationUpdate> {
        self.updates.clone()
    }

    /// Submit a user message. On acceptance returns the new exchange id and
    /// the effects that open the request.
    pub fn submit_user_message(
        &mut self,
        content: Option<String>,
        image_ref: Option<String>,
    ) -> Result<(ExchangeId, Vec<Effect>), TransitionError> {
        let exchange = ExchangeId(self.last_exchange + 1);
        let effects = self.apply(Event::UserMessage {
            content,
            image_ref,
            exchange,
        })?;
        self.last_exchange = exchange.0;
        Ok((exchange, effects))
    }

    pub fn on_delta(&mut self, exchange: ExchangeId, text: impl Into<String>) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::Delta {
            exchange,
            text: text.into(),
        })
    }

    pub fn on_stream_end(&mut self, exchange: ExchangeId) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::StreamEnd { exchange })
    }

    pub fn on_response(&mut self, exchange: ExchangeId, content: impl Into<String>) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::Response {
            exchange,
            content: content.into(),
        })
    }

    pub fn on_stream_error(&mut self, exchange: ExchangeId, error: ExchangeError) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::StreamError { exchange, error })
    }

    pub fn on_timeout(&mut self, exchange: ExchangeId) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::Timeout { exchange })
    }

    pub fn cancel(&mut self) -> Result<Vec<Effect>, TransitionError> {
        self.apply(Event::UserCancel)
    }

    /// Run one event through the state machine.
    ///
    /// Returns the effects that need I/O. A rejected event leaves state and
    /// log untouched and notifies nobody.
    pub fn apply(&mut self, event: Event) -> Result<Vec<Effect>, TransitionError> {
        let event_name = event.name();
        let result = transition(&self.state, &self.context, event).inspect_err(|e| {
            tracing::debug!(
                conv_id = %self.context.conversation_id,
                state = self.state.name(),
                event = event_name,
                error = %e,
                "Event rejected"
            );
        })?;

        if result.is_noop() {
            tracing::trace!(
                conv_id = %self.context.conversation_id,
                event = event_name,
                "Event dropped"
            );
            return Ok(Vec::new());
        }

        let previous = std::mem::replace(&mut self.state, result.new_state);
        if previous.name() != self.state.name() {
            tracing::debug!(
                conv_id = %self.context.conversation_id,
                from = previous.name(),
                to = self.state.name(),
                "State transition"
            );
        }

        let mut changes = Vec::new();
        let mut outcome = None;
        let mut io_effects = Vec::new();

        for effect in result.effects {
            if effect.is_log_mutation() {
                changes.extend(self.apply_log_effect(effect));
                continue;
            }
            if let Effect::NotifyOutcome { outcome: o, .. } = &effect {
                outcome = Some(o.clone());
            }
            io_effects.push(effect);
        }

        // Preview is recomputed here, in the same update as the changes
        self.seq += 1;
        let update = ConversationUpdate {
            seq: self.seq,
            changes,
            state: self.state,
            preview: self.conversation.preview(),
            generating: self.state.is_busy(),
            outcome,
        };
        // No subscribers is not an error
        let _ = self.updates.send(update);

        Ok(io_effects)
    }

    fn apply_log_effect(&mut self, effect: Effect) -> Option<Change> {
        let now = Utc::now();
        match effect {
            Effect::AppendUserMessage { content, image_ref } => {
                Some(self.append(Message::user(content, image_ref, now)))
            }
            Effect::AppendAssistantMessage { content } => Some(self.append(Message::assistant(content, now))),
            Effect::BeginAssistantMessage => {
                let index = self.conversation.begin_assistant(now);
                let message = self.conversation.messages()[index].clone();
                Some(Change::MessageAppended { index, message })
            }
            Effect::AppendDelta { text } => self
                .conversation
                .append_delta(&text)
                .map(|index| Change::DeltaApplied { index, text }),
            Effect::FinalizeAssistantMessage => self
                .conversation
                .finalize_in_progress(now)
                .map(|index| Change::MessageFinalized { index }),
            Effect::PersistSnapshot
            | Effect::RequestLlm { .. }
            | Effect::AbortLlm { .. }
            | Effect::NotifyOutcome { .. } => None,
        }
    }

    fn append(&mut self, message: Message) -> Change {
        let index = self.conversation.push_finalized(message.clone());
        Change::MessageAppended { index, message }
    }
}
