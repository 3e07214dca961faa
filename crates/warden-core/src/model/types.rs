use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One logical request to the remote chat-completion endpoint.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    /// Bounds the remote call itself, independent of retry cooldowns.
    pub timeout: Duration,
    pub messages: Vec<ChatMessage>,
    /// Per-call credential overriding the adapter's process-wide default.
    pub credential: Option<String>,
}

/// What the remote service answered.
///
/// `completion_tokens == 0` signals failure regardless of `content`: the
/// apology strings produced on exhausted retries are token-free by
/// construction, which is how callers tell "call failed" from "model said
/// something".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionResult {
    pub content: String,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl CompletionResult {
    pub fn failed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.completion_tokens == 0
    }
}

/// Classified remote failure; the class decides the retry policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CompletionFailure {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("remote error: {0}")]
    Other(String),
}
