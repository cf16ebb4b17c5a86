//! Conversation runtime executor

use super::traits::{ImageHost, SnapshotStore};
use super::{Command, ConversationHandle};

use crate::conversation::{Conversation, Role};
use crate::llm::{ChatMessage, ChatRequest, LlmService};
use crate::reducer::ConversationReducer;
use crate::state_machine::{Effect, ExchangeId, ExchangeOutcome, TransitionError};
use crate::stream::decode_stream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Per-runtime exchange policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Request streamed responses; otherwise use the one-shot path
    pub stream: bool,
    /// Cancel an exchange that has not finished after this long
    pub timeout: Option<Duration>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stream: true,
            timeout: None,
        }
    }
}

/// Generic conversation runtime that can work with any storage and LLM implementation
pub struct ConversationRuntime<S, L>
where
    S: SnapshotStore + 'static,
    L: LlmService + ?Sized + 'static,
{
    reducer: ConversationReducer,
    storage: S,
    llm: Arc<L>,
    settings: RuntimeSettings,
    command_rx: mpsc::Receiver<Command>,
    /// Weak so the loop ends once every handle is dropped
    command_tx: mpsc::WeakSender<Command>,
    /// Token to cancel the running exchange task
    llm_cancel_token: Option<CancellationToken>,
    timeout_task: Option<JoinHandle<()>>,
}

impl<S, L> ConversationRuntime<S, L>
where
    S: SnapshotStore + 'static,
    L: LlmService + ?Sized + 'static,
{
    /// Start the runtime task and return a handle to it
    pub fn spawn(
        reducer: ConversationReducer,
        storage: S,
        llm: Arc<L>,
        settings: RuntimeSettings,
        images: Arc<dyn ImageHost>,
    ) -> ConversationHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = ConversationHandle {
            command_tx: command_tx.clone(),
            updates: reducer.update_sender(),
            images,
        };

        let runtime = Self {
            reducer,
            storage,
            llm,
            settings,
            command_rx,
            command_tx: command_tx.downgrade(),
            llm_cancel_token: None,
            timeout_task: None,
        };
        tokio::spawn(runtime.run());

        handle
    }

    pub async fn run(mut self) {
        let conv_id = self.reducer.context().conversation_id.clone();
        tracing::info!(conv_id = %conv_id, "Starting conversation runtime");

        while let Some(command) = self.command_rx.recv().await {
            self.handle_command(command).await;

            // Whatever ended the exchange, its task and timer go with it
            if !self.reducer.is_generating() {
                self.clear_exchange();
            }
        }

        self.clear_exchange();
        tracing::info!(conv_id = %conv_id, "Conversation runtime stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Submit {
                content,
                image_ref,
                reply,
            } => match self.reducer.submit_user_message(content, image_ref) {
                Ok((exchange, effects)) => {
                    let _ = reply.send(Ok(exchange));
                    Ok(effects)
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            },
            Command::Cancel { reply } => match self.reducer.cancel() {
                Ok(effects) => {
                    let _ = reply.send(Ok(()));
                    Ok(effects)
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            },
            Command::Snapshot { reply } => {
                let _ = reply.send(self.reducer.view());
                return;
            }
            Command::Delta { exchange, text } => self.reducer.on_delta(exchange, text),
            Command::StreamEnd { exchange } => self.reducer.on_stream_end(exchange),
            Command::Response { exchange, content } => self.reducer.on_response(exchange, content),
            Command::StreamError { exchange, error } => self.reducer.on_stream_error(exchange, error),
            Command::Timeout { exchange } => self.reducer.on_timeout(exchange),
        };

        match result {
            Ok(effects) => {
                for effect in effects {
                    self.execute_effect(effect).await;
                }
            }
            Err(e) => self.log_rejected(&e),
        }
    }

    fn log_rejected(&self, error: &TransitionError) {
        tracing::warn!(
            conv_id = %self.reducer.context().conversation_id,
            state = self.reducer.state().name(),
            error = %error,
            "Response event rejected"
        );
    }

    /// Execute one I/O effect
    async fn execute_effect(&mut self, effect: Effect) {
        match effect {
            Effect::PersistSnapshot => {
                let snapshot = self.reducer.conversation().snapshot();
                if let Err(e) = self.storage.save_snapshot(&snapshot).await {
                    // The in-memory log stays authoritative
                    tracing::error!(
                        conv_id = %snapshot.id,
                        error = %e,
                        "Failed to persist conversation snapshot"
                    );
                }
            }

            Effect::RequestLlm { exchange } => self.start_exchange(exchange),

            Effect::AbortLlm { exchange } => {
                tracing::info!(
                    conv_id = %self.reducer.context().conversation_id,
                    exchange = %exchange,
                    "Aborting LLM request"
                );
                self.clear_exchange();
            }

            Effect::NotifyOutcome { exchange, outcome } => self.log_outcome(exchange, &outcome),

            Effect::AppendUserMessage { .. }
            | Effect::BeginAssistantMessage
            | Effect::AppendDelta { .. }
            | Effect::FinalizeAssistantMessage
            | Effect::AppendAssistantMessage { .. } => {
                tracing::warn!(?effect, "Log effect reached the runtime; ignoring");
            }
        }
    }

    fn log_outcome(&self, exchange: ExchangeId, outcome: &ExchangeOutcome) {
        let conv_id = &self.reducer.context().conversation_id;
        match outcome {
            ExchangeOutcome::Completed => {
                tracing::info!(conv_id = %conv_id, exchange = %exchange, "Exchange completed");
            }
            ExchangeOutcome::Cancelled { partial_kept } | ExchangeOutcome::TimedOut { partial_kept } => {
                tracing::info!(
                    conv_id = %conv_id,
                    exchange = %exchange,
                    timed_out = matches!(outcome, ExchangeOutcome::TimedOut { .. }),
                    partial_kept,
                    "Exchange stopped"
                );
            }
            ExchangeOutcome::Failed { error, partial_kept } => {
                tracing::warn!(
                    conv_id = %conv_id,
                    exchange = %exchange,
                    kind = ?error.kind,
                    error = %error,
                    partial_kept,
                    "Exchange failed"
                );
            }
        }
    }

    /// Spawn the request task, raced against a fresh cancellation token
    fn start_exchange(&mut self, exchange: ExchangeId) {
        self.clear_exchange();

        let cancel_token = CancellationToken::new();
        self.llm_cancel_token = Some(cancel_token.clone());

        let context = self.reducer.context();
        let request = build_chat_request(self.reducer.conversation(), &context.owner_id);
        let conv_id = context.conversation_id.clone();
        let model = context.model_id.clone();
        let llm = self.llm.clone();
        let command_tx = self.command_tx.clone();
        let stream = self.settings.stream;

        tokio::spawn(async move {
            tracing::info!(
                conv_id = %conv_id,
                exchange = %exchange,
                model = %model,
                stream,
                messages = request.messages.len(),
                "Making LLM request (background)"
            );

            tokio::select! {
                biased;

                () = cancel_token.cancelled() => {
                    tracing::info!(conv_id = %conv_id, exchange = %exchange, "LLM request cancelled");
                }

                () = run_exchange(llm.as_ref(), &request, exchange, stream, &command_tx) => {}
            }
        });

        if let Some(timeout) = self.settings.timeout {
            let command_tx = self.command_tx.clone();
            self.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                send(&command_tx, Command::Timeout { exchange }).await;
            }));
        }
    }

    /// Tear down the running exchange task and its timer, if any
    fn clear_exchange(&mut self) {
        if let Some(token) = self.llm_cancel_token.take() {
            token.cancel();
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

/// Perform one exchange and report back through the command channel.
///
/// Every command is tagged with `exchange`, so anything that arrives after
/// the exchange was cancelled is dropped by the state machine.
async fn run_exchange<L: LlmService + ?Sized>(
    llm: &L,
    request: &ChatRequest,
    exchange: ExchangeId,
    stream: bool,
    command_tx: &mpsc::WeakSender<Command>,
) {
    if !stream {
        let command = match llm.complete(request).await {
            Ok(response) => Command::Response {
                exchange,
                content: response.content,
            },
            Err(e) => Command::StreamError {
                exchange,
                error: e.into(),
            },
        };
        send(command_tx, command).await;
        return;
    }

    let body = match llm.open_stream(request).await {
        Ok(body) => body,
        Err(e) => {
            send(
                command_tx,
                Command::StreamError {
                    exchange,
                    error: e.into(),
                },
            )
            .await;
            return;
        }
    };

    let mut deltas = std::pin::pin!(decode_stream(body));
    while let Some(item) = deltas.next().await {
        let command = match item {
            Ok(text) => Command::Delta { exchange, text },
            Err(error) => {
                send(command_tx, Command::StreamError { exchange, error }).await;
                return;
            }
        };
        if !send(command_tx, command).await {
            return;
        }
    }

    send(command_tx, Command::StreamEnd { exchange }).await;
}

/// Returns false once the runtime is gone
async fn send(command_tx: &mpsc::WeakSender<Command>, command: Command) -> bool {
    match command_tx.upgrade() {
        Some(tx) => tx.send(command).await.is_ok(),
        None => false,
    }
}

/// Outbound history: role and text only. An image is referenced by its
/// resolved URL; messages with nothing to say are left out. `user` is the
/// end-user id forwarded to the provider.
pub(crate) fn build_chat_request(conversation: &Conversation, user: &str) -> ChatRequest {
    let messages = conversation
        .finalized_messages()
        .iter()
        .filter_map(|message| {
            let text = match (message.content.as_deref(), message.image_ref.as_deref()) {
                (Some(text), Some(url)) if !text.is_empty() => format!("{text}\n{url}"),
                (_, Some(url)) => url.to_string(),
                (Some(text), None) if !text.is_empty() => text.to_string(),
                (_, None) => return None,
            };
            Some(match message.role {
                Role::User => ChatMessage::user(text),
                Role::Assistant => ChatMessage::assistant(text),
            })
        })
        .collect();

    ChatRequest {
        messages,
        user: Some(user.to_string()),
    }
}
