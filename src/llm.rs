//! Model invocation: the client trait and the OpenAI-compatible provider.

pub mod openrouter;

pub use openrouter::OpenRouterClient;

use crate::conversation::PromptMessage;
use crate::error::ModelError;

use async_trait::async_trait;

/// Sends an assembled prompt to a language model and returns its reply.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model name reported in status output.
    fn model_name(&self) -> &str;

    /// Whether the client has what it needs to make calls.
    fn is_configured(&self) -> bool {
        true
    }

    /// One chat completion. Never retried by the caller.
    async fn invoke(&self, messages: &[PromptMessage]) -> Result<String, ModelError>;
}
