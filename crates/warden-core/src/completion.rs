//! Rate-limited, bounded-retry wrapper around the model port.
//!
//! A failed call always resolves to a `CompletionResult` carrying a
//! user-facing apology and zero completion tokens; the dispatcher delivers it
//! like any reply, so the sender is never left waiting.

use std::sync::Arc;

use tokio::time::sleep;

use crate::{
    config::Config,
    limiter::TokenBucket,
    model::{
        client::ModelClient,
        types::{ChatMessage, CompletionFailure, CompletionRequest, CompletionResult},
    },
};

/// At most 2 retries, 3 attempts total.
const MAX_RETRIES: u32 = 2;

/// Completion outcome plus the session verdict: an unclassified remote error
/// leaves the session state suspect, so the owner must discard it.
#[derive(Clone, Debug)]
pub struct CompletionReply {
    pub result: CompletionResult,
    pub discard_session: bool,
}

pub struct CompletionRunner {
    client: Arc<dyn ModelClient>,
    limiter: Option<TokenBucket>,
}

impl CompletionRunner {
    pub fn new(cfg: &Config, client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            limiter: cfg.rate_limit_per_minute.map(TokenBucket::per_minute),
        }
    }

    pub async fn complete(
        &self,
        cfg: &Config,
        messages: Vec<ChatMessage>,
        credential: Option<String>,
    ) -> CompletionReply {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let failure = if !self.acquire_token() {
                // Local bucket empty: a rate-limit failure without touching
                // the remote service.
                CompletionFailure::RateLimited("local rate limit exceeded".to_string())
            } else {
                let req = CompletionRequest {
                    model: cfg.model.clone(),
                    temperature: cfg.temperature,
                    top_p: cfg.top_p,
                    frequency_penalty: cfg.frequency_penalty,
                    presence_penalty: cfg.presence_penalty,
                    timeout: cfg.request_timeout,
                    messages: messages.clone(),
                    credential: credential.clone(),
                };
                match self.client.complete(req).await {
                    Ok(result) => {
                        return CompletionReply {
                            result,
                            discard_session: false,
                        }
                    }
                    Err(failure) => failure,
                }
            };

            let can_retry = attempt <= MAX_RETRIES;
            match failure {
                CompletionFailure::RateLimited(reason) => {
                    tracing::warn!(attempt, %reason, "completion rate limited");
                    if can_retry {
                        sleep(cfg.rate_limit_cooldown).await;
                        continue;
                    }
                    return failed(&cfg.rate_limited_message);
                }
                CompletionFailure::Timeout(reason) => {
                    tracing::warn!(attempt, %reason, "completion timed out");
                    if can_retry {
                        sleep(cfg.timeout_cooldown).await;
                        continue;
                    }
                    return failed(&cfg.timeout_message);
                }
                CompletionFailure::ConnectionError(reason) => {
                    // Network is down; retrying now cannot help.
                    tracing::warn!(attempt, %reason, "completion connection error");
                    return failed(&cfg.connection_message);
                }
                CompletionFailure::Other(reason) => {
                    tracing::warn!(attempt, %reason, "completion failed");
                    return CompletionReply {
                        result: CompletionResult::failed(&cfg.busy_message),
                        discard_session: true,
                    };
                }
            }
        }
    }

    fn acquire_token(&self) -> bool {
        self.limiter.as_ref().map_or(true, TokenBucket::try_acquire)
    }
}

fn failed(content: &str) -> CompletionReply {
    CompletionReply {
        result: CompletionResult::failed(content),
        discard_session: false,
    }
}
