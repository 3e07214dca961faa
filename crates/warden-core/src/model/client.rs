use async_trait::async_trait;

use super::types::{CompletionFailure, CompletionRequest, CompletionResult};

/// Port for the remote chat-completion service.
///
/// Implementations issue exactly one request per `complete` call and classify
/// failures; retry policy lives in the core's completion runner, never here.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        req: CompletionRequest,
    ) -> std::result::Result<CompletionResult, CompletionFailure>;
}
