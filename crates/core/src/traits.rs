use crate::error::ModelError;
use crate::llm::{ChatMessage, CompletionOptions};
use crate::models::ConversationTurn;
use async_trait::async_trait;

/// A text-completion service reached over the network.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ModelError>;
}

/// Produces the final answer from retrieved context. The retrieval engine
/// never calls this; the session layer does.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        system_instructions: &str,
        history: &[ConversationTurn],
        question: &str,
        context_text: &str,
    ) -> Result<String, ModelError>;
}
