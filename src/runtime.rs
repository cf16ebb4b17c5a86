//! Runtime for executing conversations
//!
//! One [`ConversationRuntime`] task per open conversation owns the reducer
//! and performs the I/O its transitions ask for. Everything else talks to
//! it through a cloneable [`ConversationHandle`].

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ConversationRuntime, RuntimeSettings};
pub use traits::*;

use crate::error::ExchangeError;
use crate::reducer::{ConversationUpdate, ConversationView};
use crate::state_machine::{ExchangeId, TransitionError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Messages processed by the runtime loop, in arrival order
#[derive(Debug)]
pub(crate) enum Command {
    // From handles
    Submit {
        content: Option<String>,
        image_ref: Option<String>,
        reply: oneshot::Sender<Result<ExchangeId, TransitionError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), TransitionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ConversationView>,
    },

    // From the exchange task
    Delta {
        exchange: ExchangeId,
        text: String,
    },
    StreamEnd {
        exchange: ExchangeId,
    },
    Response {
        exchange: ExchangeId,
        content: String,
    },
    StreamError {
        exchange: ExchangeId,
        error: ExchangeError,
    },

    // From the deadline timer
    Timeout {
        exchange: ExchangeId,
    },
}

/// Why a submission or cancellation did not go through
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] TransitionError),
    #[error("Image upload failed: {0}")]
    ImageUpload(String),
    #[error("Conversation runtime has stopped")]
    RuntimeStopped,
}

/// Handle to interact with a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    command_tx: mpsc::Sender<Command>,
    updates: broadcast::Sender<ConversationUpdate>,
    images: Arc<dyn ImageHost>,
}

impl ConversationHandle {
    /// Submit a user message, uploading the image first if there is one
    pub async fn submit(&self, content: Option<String>, image: Option<&Path>) -> Result<ExchangeId, SubmitError> {
        let image_ref = match image {
            Some(path) => Some(self.images.resolve(path).await.map_err(SubmitError::ImageUpload)?),
            None => None,
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            content,
            image_ref,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SubmitError::RuntimeStopped)??)
    }

    /// Stop generating; partial output is kept
    pub async fn cancel(&self) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { reply }).await?;
        Ok(rx.await.map_err(|_| SubmitError::RuntimeStopped)??)
    }

    /// Current log, including any in-progress message, tagged with the
    /// sequence number of the last update it reflects
    pub async fn snapshot(&self) -> Result<ConversationView, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| SubmitError::RuntimeStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), SubmitError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SubmitError::RuntimeStopped)
    }
}
