//! streamchat - terminal chat client for OpenAI-compatible endpoints
//!
//! Streams assistant answers token by token into a persistent
//! conversation log, one exchange at a time.

mod cli;
mod conversation;
mod db;
mod error;
mod llm;
mod reducer;
mod runtime;
mod state_machine;
mod stream;

use db::Database;
use llm::{LlmConfig, LlmService, LoggingService, OpenAIService};
use runtime::{LocalImageHost, RuntimeSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; stdout is reserved for the transcript
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "streamchat=info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Configuration
    let db_path = std::env::var("STREAMCHAT_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.streamchat/streamchat.db")
    });
    let owner_id = std::env::var("STREAMCHAT_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "local".to_string());

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    let llm_config = LlmConfig::from_env();
    let llm: Arc<dyn LlmService> = Arc::new(LoggingService::new(Arc::new(OpenAIService::new(&llm_config)?)));
    if llm.has_credential() {
        tracing::info!(
            model = %llm.model_id(),
            endpoint = %llm_config.base_url,
            stream = llm_config.stream,
            "LLM service initialized"
        );
    } else {
        tracing::warn!("No LLM API key configured. Set OPENROUTER_API_KEY or OPENAI_API_KEY.");
    }

    let app = cli::App {
        db,
        llm,
        images: Arc::new(LocalImageHost),
        settings: RuntimeSettings {
            stream: llm_config.stream,
            timeout: llm_config.timeout,
        },
        owner_id,
    };

    let conversation = app
        .db
        .create_conversation(&uuid::Uuid::new_v4().to_string(), &app.owner_id)?;
    cli::run(&app, conversation).await
}
