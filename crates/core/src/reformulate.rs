use crate::error::ModelError;
use crate::llm::{clean_reply, conversation_messages, ChatMessage, CompletionOptions};
use crate::models::ConversationTurn;
use crate::traits::ChatModel;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);

pub const REFORMULATION_INSTRUCTIONS: &str = "\
You rewrite questions for a document search engine. Given the chat history and \
the latest user question, return a standalone question that can be understood \
without the history.

Rules:
1. If the latest question is a follow-up that relies on the history (for example \
\"what about accommodation?\" or \"how much does it cost?\"), rewrite it so it names \
the subject being discussed, such as the university, city or program.
2. If the latest question introduces a new subject, return it exactly as written \
and do not carry over anything from the history.

Do not answer the question. Return only the question text.";

/// Turns a follow-up question into one that stands on its own.
pub struct QueryReformulator {
    model: Arc<dyn ChatModel>,
    instructions: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl QueryReformulator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            instructions: REFORMULATION_INSTRUCTIONS.to_string(),
            options: CompletionOptions::default(),
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn messages(&self, history: &[ConversationTurn], question: &str) -> Vec<ChatMessage> {
        conversation_messages(self.instructions.clone(), history, question)
    }

    /// With no history the question is returned as-is and the model is not
    /// called. Otherwise exactly one model call is made; failures propagate.
    pub async fn reformulate(
        &self,
        history: &[ConversationTurn],
        question: &str,
    ) -> Result<String, ModelError> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let messages = self.messages(history, question);
        let reply = tokio::time::timeout(self.timeout, self.model.complete(&messages, &self.options))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;

        let standalone = clean_reply(&reply);
        if standalone.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        debug!(original = %question, reformulated = %standalone, turns = history.len(), "question reformulated");
        Ok(standalone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;
    use crate::traits::fakes::ScriptedModel;
    use async_trait::async_trait;

    /// Applies the two rewriting rules mechanically: a question naming a
    /// capitalised subject is left alone, anything else gets the subject of
    /// the first user turn attached.
    struct RuleFollowingModel;

    #[async_trait]
    impl ChatModel for RuleFollowingModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String, ModelError> {
            let question = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
            let names_subject = question
                .split_whitespace()
                .skip(1)
                .any(|word| word.starts_with(char::is_uppercase));
            if names_subject {
                return Ok(question.to_string());
            }

            let subject = messages
                .iter()
                .find(|m| m.role == ChatRole::User)
                .and_then(|m| m.content.split(" at ").nth(1))
                .map(|rest| rest.trim_end_matches('?'))
                .unwrap_or_default();
            Ok(format!("\"{} at {subject}?\"", question.trim_end_matches('?')))
        }
    }

    fn qatar_history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("What are the fees at Qatar University?"),
            ConversationTurn::assistant("Tuition is charged per credit hour."),
        ]
    }

    #[tokio::test]
    async fn empty_history_skips_the_model() {
        let model = Arc::new(ScriptedModel::default());
        let reformulator = QueryReformulator::new(model.clone());

        let question = reformulator
            .reformulate(&[], "  what about accommodation?")
            .await
            .expect("no model call needed");

        assert_eq!(question, "  what about accommodation?");
        assert_eq!(model.request_count(), 0);
    }

    #[tokio::test]
    async fn follow_up_gains_the_subject() {
        let reformulator = QueryReformulator::new(Arc::new(RuleFollowingModel));
        let question = reformulator
            .reformulate(&qatar_history(), "what about accommodation?")
            .await
            .expect("model replies");

        assert!(question.contains("Qatar University"), "got {question}");
        assert!(!question.starts_with('"'));
    }

    #[tokio::test]
    async fn new_topic_is_returned_unchanged() {
        let reformulator = QueryReformulator::new(Arc::new(RuleFollowingModel));
        let question = reformulator
            .reformulate(&qatar_history(), "Tell me about Wheeling")
            .await
            .expect("model replies");

        assert_eq!(question, "Tell me about Wheeling");
    }

    #[tokio::test]
    async fn one_call_carries_rules_then_history_then_question() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(
            "What accommodation does Qatar University offer?".to_string(),
        )]));
        let reformulator = QueryReformulator::new(model.clone());
        reformulator
            .reformulate(&qatar_history(), "what about accommodation?")
            .await
            .expect("model replies");

        let requests = model.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        let messages = &requests[0];
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("standalone question"));
        assert!(messages[0].content.contains("new subject"));
        assert_eq!(messages[1].content, "What are the fees at Qatar University?");
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert_eq!(messages[3].content, "what about accommodation?");
    }

    #[tokio::test]
    async fn failures_propagate_without_fallback() {
        let model = Arc::new(ScriptedModel::replying(vec![Err(ModelError::RateLimited(
            "try later".to_string(),
        ))]));
        let reformulator = QueryReformulator::new(model.clone());

        let result = reformulator
            .reformulate(&qatar_history(), "what about accommodation?")
            .await;
        assert!(matches!(result, Err(ModelError::RateLimited(_))));
        assert_eq!(model.request_count(), 1);
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok("  \"\"  ".to_string())]));
        let reformulator = QueryReformulator::new(model);

        let result = reformulator.reformulate(&qatar_history(), "and parking?").await;
        assert!(matches!(result, Err(ModelError::EmptyResponse)));
    }

    struct StalledModel;

    #[async_trait]
    impl ChatModel for StalledModel {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let reformulator =
            QueryReformulator::new(Arc::new(StalledModel)).with_timeout(Duration::from_millis(20));

        let result = reformulator.reformulate(&qatar_history(), "and parking?").await;
        assert!(matches!(result, Err(ModelError::Timeout(_))));
    }
}
