//! Configuration for the completions endpoint

use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "mistralai/mistral-small-3.1-24b-instruct:free";
pub const DEFAULT_REFERER: &str = "http://localhost";
pub const DEFAULT_TITLE: &str = "Chat AI App";

/// Configuration for the LLM provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    /// Full URL of the chat completions endpoint
    pub base_url: String,
    pub model: String,
    /// Request streaming responses; `false` selects the one-shot fallback
    pub stream: bool,
    /// Give up on an exchange after this long
    pub timeout: Option<Duration>,
    /// Attribution headers (`HTTP-Referer`, `X-Title`)
    pub referer: String,
    pub title: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            stream: true,
            timeout: None,
            referer: DEFAULT_REFERER.to_string(),
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            api_key: non_empty("OPENROUTER_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")),
            base_url: non_empty("STREAMCHAT_BASE_URL").unwrap_or(defaults.base_url),
            model: non_empty("STREAMCHAT_MODEL").unwrap_or(defaults.model),
            stream: non_empty("STREAMCHAT_STREAM").map_or(defaults.stream, |v| parse_flag(&v)),
            timeout: non_empty("STREAMCHAT_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            referer: non_empty("STREAMCHAT_REFERER").unwrap_or(defaults.referer),
            title: non_empty("STREAMCHAT_TITLE").unwrap_or(defaults.title),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
