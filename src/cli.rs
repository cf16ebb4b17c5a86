//! Terminal client
//!
//! Reads one line per message from stdin and prints the assistant's answer
//! as it streams in. Diagnostics go to stderr through `tracing`; stdout
//! carries only the transcript.

use crate::conversation::{Conversation, Role};
use crate::db::{ConversationSummary, Database};
use crate::error::ExchangeErrorKind;
use crate::llm::LlmService;
use crate::reducer::{Change, ConversationReducer, ConversationUpdate, ConversationView};
use crate::runtime::{ConversationHandle, ConversationRuntime, DatabaseStorage, ImageHost, RuntimeSettings, SubmitError};
use crate::state_machine::{ConvContext, ExchangeOutcome};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "Commands: /image <path> [text], /new, /list, /open <id>, /quit";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message {
        text: Option<String>,
        image: Option<PathBuf>,
    },
    New,
    List,
    Open(String),
    Quit,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message {
            text: Some(line.to_string()),
            image: None,
        };
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name {
        "new" => Input::New,
        "list" => Input::List,
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        "open" if !rest.is_empty() => Input::Open(rest.to_string()),
        "image" if !rest.is_empty() => {
            let (path, text) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, None), |(path, text)| (path, Some(text.trim().to_string())));
            Input::Message {
                text: text.filter(|t| !t.is_empty()),
                image: Some(PathBuf::from(path)),
            }
        }
        _ => Input::Unknown(line.to_string()),
    }
}

/// Turns updates into transcript text, tracking how much of the log is
/// already on screen so a lagging subscriber can catch up from a snapshot
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    /// First message not yet fully printed
    next_index: usize,
    /// Bytes of that message already printed
    shown_bytes: usize,
    /// Updates up to this sequence number are covered by a re-sync
    synced_seq: u64,
}

impl TranscriptPrinter {
    /// Printer for a conversation whose existing messages are already shown
    pub fn starting_after(conversation: &Conversation) -> Self {
        Self {
            next_index: conversation.messages().len(),
            ..Self::default()
        }
    }

    /// Transcript text for one update
    pub fn render(&mut self, update: &ConversationUpdate) -> String {
        let mut out = String::new();
        if update.seq <= self.synced_seq {
            return out;
        }
        for change in &update.changes {
            match change {
                // A streamed message starts empty; its deltas follow
                Change::MessageAppended { index, message }
                    if message.role == Role::Assistant && update.generating =>
                {
                    self.advance_to(*index);
                }
                Change::MessageAppended { index, message } => {
                    if message.role == Role::Assistant && !message.text().is_empty() {
                        out.push_str(message.text());
                        out.push('\n');
                    }
                    self.advance_to(index + 1);
                }
                Change::DeltaApplied { index, text } => {
                    out.push_str(text);
                    if *index == self.next_index {
                        self.shown_bytes += text.len();
                    }
                }
                Change::MessageFinalized { index } => {
                    out.push('\n');
                    self.advance_to(index + 1);
                }
            }
        }
        if let Some(notice) = update.outcome.as_ref().and_then(outcome_notice) {
            out.push_str(&notice);
            out.push('\n');
        }
        out
    }

    /// Whatever `view` holds past the printed point; updates it already
    /// covers are skipped afterwards
    pub fn resync(&mut self, view: &ConversationView) -> String {
        let mut out = String::new();
        let messages = view.conversation.messages();
        let streaming = view.conversation.in_progress().is_some();
        for (index, message) in messages.iter().enumerate().skip(self.next_index) {
            if message.role == Role::User {
                self.advance_to(index + 1);
                continue;
            }
            let text = message.text();
            out.push_str(text.get(self.shown_bytes..).unwrap_or_default());
            if streaming && index + 1 == messages.len() {
                self.next_index = index;
                self.shown_bytes = text.len();
            } else {
                if !text.is_empty() {
                    out.push('\n');
                }
                self.advance_to(index + 1);
            }
        }
        self.synced_seq = self.synced_seq.max(view.seq);
        out
    }

    fn advance_to(&mut self, index: usize) {
        self.next_index = index;
        self.shown_bytes = 0;
    }
}

/// How an exchange ended, when there is something to say about it
pub fn outcome_notice(outcome: &ExchangeOutcome) -> Option<String> {
    let what = match outcome {
        ExchangeOutcome::Completed => return None,
        ExchangeOutcome::Cancelled { .. } => "cancelled".to_string(),
        ExchangeOutcome::TimedOut { .. } => "timed out".to_string(),
        ExchangeOutcome::Failed { error, .. } => format!("failed: {}", error.message),
    };
    let kept = if outcome.partial_kept() { "; partial answer kept" } else { "" };
    let retry = if outcome.retry_available() { "; send again to retry" } else { "" };
    Some(format!("[{what}{kept}{retry}]"))
}

/// Why a submission did not start
pub fn rejection_notice(error: &SubmitError) -> String {
    let SubmitError::Rejected(rejection) = error else {
        return format!("[{error}]");
    };
    match rejection.kind() {
        Some(ExchangeErrorKind::ConfigurationMissing) => {
            "[cannot start: no API key configured; set OPENROUTER_API_KEY]".to_string()
        }
        Some(ExchangeErrorKind::Busy) => "[still answering; press Ctrl-C to cancel first]".to_string(),
        _ => format!("[{rejection}]"),
    }
}

pub fn format_summary(summary: &ConversationSummary) -> String {
    format!(
        "{}  {}  {}",
        summary.id,
        summary.updated_at.format("%Y-%m-%d %H:%M"),
        summary.preview
    )
}

/// Full transcript of a loaded conversation
pub fn format_transcript(conversation: &Conversation) -> String {
    let mut out = String::new();
    for message in conversation.messages() {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        out.push_str(speaker);
        out.push_str("> ");
        out.push_str(message.text());
        if let Some(url) = &message.image_ref {
            if !message.text().is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("[image: {url}]"));
        }
        out.push('\n');
    }
    out
}

/// Everything needed to open a conversation runtime
pub struct App {
    pub db: Database,
    pub llm: Arc<dyn LlmService>,
    pub images: Arc<dyn ImageHost>,
    pub settings: RuntimeSettings,
    pub owner_id: String,
}

/// An open conversation and its transcript position
struct Session {
    id: String,
    handle: ConversationHandle,
    updates: broadcast::Receiver<ConversationUpdate>,
    printer: TranscriptPrinter,
}

impl Session {
    fn open(app: &App, conversation: Conversation) -> Self {
        let id = conversation.id.clone();
        let printer = TranscriptPrinter::starting_after(&conversation);
        let context = ConvContext::new(&conversation.id, &app.owner_id, app.llm.model_id())
            .with_credential(app.llm.has_credential());
        let reducer = ConversationReducer::new(context, conversation);
        let handle = ConversationRuntime::spawn(
            reducer,
            DatabaseStorage::new(app.db.clone()),
            app.llm.clone(),
            app.settings,
            app.images.clone(),
        );
        let updates = handle.subscribe();

        Self {
            id,
            handle,
            updates,
            printer,
        }
    }

    fn show(&mut self, update: &ConversationUpdate) {
        print_out(&self.printer.render(update));
    }

    /// Reprint from a snapshot after the update channel dropped some updates
    async fn catch_up(&mut self, skipped: u64) {
        tracing::warn!(conv_id = %self.id, skipped, "Transcript fell behind, re-syncing");
        match self.handle.snapshot().await {
            Ok(view) => print_out(&self.printer.resync(&view)),
            Err(e) => tracing::warn!(conv_id = %self.id, error = %e, "Transcript re-sync failed"),
        }
    }

    /// Stop any exchange and print what it produced. Dropping the last
    /// handle ends the runtime loop.
    async fn close(mut self) {
        let _ = self.handle.cancel().await;
        loop {
            match self.updates.try_recv() {
                Ok(update) => self.show(&update),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => self.catch_up(skipped).await,
                Err(_) => break,
            }
        }
    }
}

/// What woke the interactive loop
enum Wake {
    Update(Result<ConversationUpdate, broadcast::error::RecvError>),
    Line(Option<String>),
    Interrupt,
}

fn print_out(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

/// Interactive loop; returns at end of input, on `/quit`, or on Ctrl-C
/// while nothing is being generated
pub async fn run(app: &App, conversation: Conversation) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = Session::open(app, conversation);
    print_out(&format!("Conversation {}\n{HELP}\n", session.id));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let wake = tokio::select! {
            update = session.updates.recv() => Wake::Update(update),
            line = lines.next_line() => Wake::Line(line?),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                Wake::Interrupt
            }
        };
        let line = match wake {
            Wake::Update(Ok(update)) => {
                session.show(&update);
                continue;
            }
            Wake::Update(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                session.catch_up(skipped).await;
                continue;
            }
            Wake::Update(Err(broadcast::error::RecvError::Closed)) | Wake::Line(None) => break,
            Wake::Interrupt => match session.handle.cancel().await {
                Ok(()) => continue,
                Err(_) => break,
            },
            Wake::Line(Some(line)) => line,
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => print_out(&format!("{HELP}\n")),
            Input::Unknown(input) => print_out(&format!("[unknown command: {input}]\n{HELP}\n")),
            Input::Message { text, image } => {
                if let Err(e) = session.handle.submit(text, image.as_deref()).await {
                    print_out(&format!("{}\n", rejection_notice(&e)));
                }
            }
            Input::New => {
                let id = uuid::Uuid::new_v4().to_string();
                let conversation = app.db.create_conversation(&id, &app.owner_id)?;
                session.close().await;
                session = Session::open(app, conversation);
                print_out(&format!("Conversation {}\n", session.id));
            }
            Input::List => {
                let summaries = app.db.list_conversations(&app.owner_id)?;
                let listing: String = summaries.iter().map(|s| format_summary(s) + "\n").collect();
                print_out(&listing);
            }
            Input::Open(id) => match app.db.get_conversation(&id) {
                Ok(conversation) if conversation.owner_id == app.owner_id => {
                    let transcript = format_transcript(&conversation);
                    session.close().await;
                    session = Session::open(app, conversation);
                    print_out(&format!("Conversation {}\n{transcript}", session.id));
                }
                Ok(_) => print_out(&format!("[conversation not found: {id}]\n")),
                Err(e) => print_out(&format!("[{e}]\n")),
            },
        }
    }

    session.close().await;
    Ok(())
}
