use crate::error::ModelError;
use crate::llm::{clean_reply, conversation_messages, CompletionOptions};
use crate::models::ConversationTurn;
use crate::reformulate::DEFAULT_MODEL_TIMEOUT;
use crate::traits::{AnswerGenerator, ChatModel};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const NO_RELEVANT_INFORMATION_REPLY: &str =
    "I couldn't find relevant information in your documents.";

pub const ADVISOR_INSTRUCTIONS: &str = "\
You are an assistant that answers questions about the user's documents.

- If the user only greets you or makes small talk, reply briefly and politely \
without referring to the documents.
- Answer only from the CONTEXT below. If the context does not contain the \
answer, say that the documents do not cover it.
- Always answer in English.
- Use bullet points when the answer has several parts.";

/// Default generator: instructions and retrieved context as the system
/// message, followed by the history and the question.
pub struct ChatAnswerGenerator {
    model: Arc<dyn ChatModel>,
    options: CompletionOptions,
    timeout: Duration,
}

impl ChatAnswerGenerator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            options: CompletionOptions::default(),
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AnswerGenerator for ChatAnswerGenerator {
    async fn generate(
        &self,
        system_instructions: &str,
        history: &[ConversationTurn],
        question: &str,
        context_text: &str,
    ) -> Result<String, ModelError> {
        let system = format!("{system_instructions}\n\nCONTEXT:\n{context_text}");
        let messages = conversation_messages(system, history, question);

        let reply = tokio::time::timeout(self.timeout, self.model.complete(&messages, &self.options))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;

        let answer = clean_reply(&reply);
        if answer.is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        debug!(chars = answer.len(), "answer generated");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;
    use crate::traits::fakes::ScriptedModel;

    #[tokio::test]
    async fn context_travels_in_the_system_message() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(
            "- Tuition is 10,000 QAR per semester.".to_string(),
        )]));
        let generator = ChatAnswerGenerator::new(model.clone());
        let history = vec![ConversationTurn::user("hi"), ConversationTurn::assistant("Hello!")];

        let answer = generator
            .generate(
                ADVISOR_INSTRUCTIONS,
                &history,
                "What is the tuition?",
                "Document Source: Fees\n\nTuition is 10,000 QAR per semester.",
            )
            .await
            .expect("model replies");
        assert_eq!(answer, "- Tuition is 10,000 QAR per semester.");

        let requests = model.requests.lock().expect("lock");
        let messages = &requests[0];
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.starts_with(ADVISOR_INSTRUCTIONS));
        assert!(messages[0].content.ends_with("Tuition is 10,000 QAR per semester."));
        assert_eq!(messages[3].content, "What is the tuition?");
    }

    #[tokio::test]
    async fn model_failure_is_surfaced() {
        let model = Arc::new(ScriptedModel::replying(vec![Err(ModelError::Api {
            status: 500,
            body: "internal".to_string(),
        })]));
        let generator = ChatAnswerGenerator::new(model);

        let result = generator
            .generate(ADVISOR_INSTRUCTIONS, &[], "question", "context")
            .await;
        assert!(matches!(result, Err(ModelError::Api { status: 500, .. })));
    }
}
