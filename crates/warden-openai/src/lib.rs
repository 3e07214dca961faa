//! OpenAI-compatible chat-completions adapter.
//!
//! One HTTP request per `complete` call; retry policy lives in the core's
//! completion runner. Failures are classified so the runner can tell a
//! cooldown-and-retry case from a dead network.

use async_trait::async_trait;
use serde_json::json;

use warden_core::model::{
    client::ModelClient,
    types::{CompletionFailure, CompletionRequest, CompletionResult},
};

pub struct OpenAiChatClient {
    api_base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiChatClient {
    /// `api_key` is the process-wide default; a per-request credential on the
    /// `CompletionRequest` overrides it.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client build");
        Self {
            api_base: api_base.into(),
            api_key,
            http,
        }
    }
}

fn endpoint(api_base: &str) -> String {
    format!("{}/chat/completions", api_base.trim_end_matches('/'))
}

fn classify_transport(e: reqwest::Error) -> CompletionFailure {
    if e.is_timeout() {
        CompletionFailure::Timeout(e.to_string())
    } else if e.is_connect() {
        CompletionFailure::ConnectionError(e.to_string())
    } else {
        CompletionFailure::Other(e.to_string())
    }
}

#[async_trait]
impl ModelClient for OpenAiChatClient {
    async fn complete(
        &self,
        req: CompletionRequest,
    ) -> std::result::Result<CompletionResult, CompletionFailure> {
        let key = req
            .credential
            .clone()
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| CompletionFailure::Other("no API credential configured".to_string()))?;

        let body = json!({
            "model": req.model,
            "temperature": req.temperature,
            "top_p": req.top_p,
            "frequency_penalty": req.frequency_penalty,
            "presence_penalty": req.presence_penalty,
            "messages": req.messages,
        });

        let resp = self
            .http
            .post(endpoint(&self.api_base))
            .bearer_auth(key)
            .timeout(req.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CompletionFailure::RateLimited(format!(
                "remote returned {status}"
            )));
        }
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            return Err(CompletionFailure::Timeout(format!("remote returned {status}")));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(CompletionFailure::Other(format!(
                "completion failed: {status} {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CompletionFailure::Other(format!("completion json error: {e}")))?;

        let content = v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let completion_tokens = v["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let total_tokens = v["usage"]["total_tokens"].as_u64().unwrap_or(0);

        tracing::debug!(completion_tokens, total_tokens, "completion answered");
        Ok(CompletionResult {
            content,
            completion_tokens,
            total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            endpoint("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
