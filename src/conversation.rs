//! Conversation and message records
//!
//! A [`Conversation`] owns an ordered message log. Every message is
//! immutable once finalized; at most one assistant message is in progress
//! at a time and it is always the last element.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest preview shown to collaborators, in characters
pub const PREVIEW_MAX_CHARS: usize = 60;

pub const EMPTY_PREVIEW: &str = "New Conversation";
pub const IMAGE_PREVIEW: &str = "Sent an image";

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    /// Durable URL produced by the image host
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: Option<String>, image_ref: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content,
            image_ref,
            created_at,
        }
    }

    pub fn assistant(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            image_ref: None,
            created_at,
        }
    }

    /// Content as text, empty when absent
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Conversation record with its message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    messages: Vec<Message>,
    /// Whether the last message is still receiving deltas
    #[serde(skip)]
    in_progress: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            messages: Vec::new(),
            in_progress: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a stored conversation; every message is finalized
    pub fn from_parts(
        id: String,
        owner_id: String,
        messages: Vec<Message>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id,
            messages,
            in_progress: false,
            created_at,
            updated_at,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages that can no longer change
    pub fn finalized_messages(&self) -> &[Message] {
        if self.in_progress {
            &self.messages[..self.messages.len() - 1]
        } else {
            &self.messages
        }
    }

    pub fn in_progress(&self) -> Option<&Message> {
        if self.in_progress {
            self.messages.last()
        } else {
            None
        }
    }

    /// Append a finalized message. Returns its index.
    ///
    /// Any in-progress message is frozen where it stands.
    pub fn push_finalized(&mut self, message: Message) -> usize {
        self.in_progress = false;
        self.updated_at = message.created_at;
        self.messages.push(message);
        self.messages.len() - 1
    }

    /// Start an empty assistant message that will receive deltas
    pub fn begin_assistant(&mut self, now: DateTime<Utc>) -> usize {
        let index = self.push_finalized(Message::assistant(String::new(), now));
        self.in_progress = true;
        index
    }

    /// Append a delta to the in-progress message
    pub fn append_delta(&mut self, text: &str) -> Option<usize> {
        if !self.in_progress {
            return None;
        }
        let index = self.messages.len() - 1;
        let message = &mut self.messages[index];
        message.content.get_or_insert_with(String::new).push_str(text);
        Some(index)
    }

    /// Freeze the in-progress message
    pub fn finalize_in_progress(&mut self, now: DateTime<Utc>) -> Option<usize> {
        if !self.in_progress {
            return None;
        }
        self.in_progress = false;
        self.updated_at = now;
        Some(self.messages.len() - 1)
    }

    /// Copy of the log without the in-progress message
    pub fn snapshot(&self) -> Conversation {
        Conversation {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            messages: self.finalized_messages().to_vec(),
            in_progress: false,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Preview of the most recent message, truncated.
    ///
    /// Messages with neither text nor image (an empty reply) are skipped.
    pub fn preview(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find_map(|message| match message.content.as_deref() {
                Some(text) if !text.trim().is_empty() => Some(truncate_preview(text)),
                _ if message.image_ref.is_some() => Some(IMAGE_PREVIEW.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| EMPTY_PREVIEW.to_string())
    }
}

/// First line, at most [`PREVIEW_MAX_CHARS`]; `…` marks anything cut
fn truncate_preview(text: &str) -> String {
    let text = text.trim();
    let line = text.lines().next().unwrap_or_default().trim_end();
    if line.len() == text.len() && line.chars().count() <= PREVIEW_MAX_CHARS {
        return line.to_string();
    }
    let mut truncated: String = line.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    truncated.push('…');
    truncated
}
