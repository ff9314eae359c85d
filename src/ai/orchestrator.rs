//! AI orchestration: bounded thread context, prompts, retried generation
//! and structured-output parsing.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::parse::parse_json_response;
use super::prompts::{self, PromptMessage};
use super::types::{
    BusinessContext, EscalationOutput, ExtractedTask, PriorityLevel, PriorityOutput, ReplyOutput,
    SentimentOutput,
};
use crate::config::AiConfig;
use crate::error::AiError;
use crate::llm::{GenerateRequest, LlmProvider, RetryPolicy};
use crate::store::{Store, ThreadRecord};

static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\r\f]+").expect("static pattern"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n(\s*\n)+").expect("static pattern"));

const TRUNCATION_MARKER: &str = "...[truncated]";

/// Everything a prompt needs about one thread.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub thread: ThreadRecord,
    /// Oldest first.
    pub messages: Vec<PromptMessage>,
    pub business: Option<BusinessContext>,
}

impl ThreadContext {
    fn latest(&self) -> Result<&PromptMessage, AiError> {
        self.messages
            .last()
            .ok_or_else(|| AiError::Validation(format!("thread {} has no messages", self.thread.id)))
    }
}

/// Runs AI tasks against one LLM provider.
pub struct AiOrchestrator {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    max_body_chars: usize,
}

impl AiOrchestrator {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmProvider>, config: &AiConfig) -> Self {
        Self {
            store,
            llm,
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base_delay),
            max_body_chars: config.context_body_max_chars,
        }
    }

    /// Recorded as the `model` of every artifact this orchestrator produces.
    pub fn model_name(&self) -> String {
        self.llm.name()
    }

    /// Load a user's thread with cleaned, bounded message bodies.
    ///
    /// A missing thread, or one owned by someone else, is a validation error.
    pub async fn thread_context(
        &self,
        user_id: &str,
        thread_id: Uuid,
    ) -> Result<ThreadContext, AiError> {
        let thread = self
            .store
            .get_thread(thread_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| AiError::Validation(format!("thread {thread_id} not found")))?;

        let messages = self
            .store
            .list_thread_messages(thread.id)
            .await?
            .into_iter()
            .map(|m| PromptMessage {
                sender: m.from_address,
                timestamp: m.sent_at.to_rfc3339(),
                body: clean_body(&m.body_text, self.max_body_chars),
            })
            .collect();
        let business = self.store.get_business_context(user_id).await?;

        Ok(ThreadContext {
            thread,
            messages,
            business,
        })
    }

    /// Call the provider under the retry policy.
    async fn generate(&self, task: &str, request: GenerateRequest) -> Result<String, AiError> {
        let llm = &self.llm;
        let request = &request;
        let text = self
            .retry
            .run(task, move |_| llm.generate(request))
            .await
            .map_err(|e| AiError::ServiceUnavailable {
                attempts: e.attempts,
                reason: e.last_error.to_string(),
            })?;
        debug!(task, chars = text.len(), "LLM response received");
        Ok(text)
    }

    async fn generate_json<T: DeserializeOwned>(
        &self,
        task: &str,
        request: GenerateRequest,
    ) -> Result<T, AiError> {
        let raw = self.generate(task, request.json()).await?;
        decode(task, parse_json_response(&raw)?)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn summarize_thread(&self, user_id: &str, thread_id: Uuid) -> Result<String, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        ctx.latest()?;
        let prompt = prompts::summary(&ctx.thread.subject, &ctx.messages, ctx.business.as_ref());
        let text = self
            .generate(
                "summarize",
                GenerateRequest::new(prompt)
                    .with_temperature(0.5)
                    .with_max_tokens(200),
            )
            .await?;
        Ok(text.trim().to_string())
    }

    /// Classify the thread by its most recent message.
    pub async fn classify_priority(
        &self,
        user_id: &str,
        thread_id: Uuid,
    ) -> Result<PriorityOutput, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        let prompt = prompts::classify(&ctx.thread.subject, ctx.latest()?, ctx.business.as_ref());
        self.generate_json(
            "classify",
            GenerateRequest::new(prompt)
                .with_temperature(0.3)
                .with_max_tokens(300),
        )
        .await
    }

    pub async fn analyze_sentiment(
        &self,
        user_id: &str,
        thread_id: Uuid,
    ) -> Result<SentimentOutput, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        ctx.latest()?;
        let prompt = prompts::sentiment(&ctx.thread.subject, &ctx.messages);
        let mut sentiment: SentimentOutput = self
            .generate_json(
                "sentiment",
                GenerateRequest::new(prompt)
                    .with_temperature(0.3)
                    .with_max_tokens(400),
            )
            .await?;

        let clamped = sentiment.clamp_scores();
        if !clamped.is_empty() {
            warn!(thread_id = %thread_id, fields = ?clamped, "Sentiment scores out of range, clamped");
        }
        Ok(sentiment)
    }

    /// Draft a reply in `tone`, else the business context's tone, else the default.
    pub async fn generate_reply(
        &self,
        user_id: &str,
        thread_id: Uuid,
        tone: Option<&str>,
    ) -> Result<ReplyOutput, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        ctx.latest()?;
        let tone = tone
            .map(str::to_string)
            .or_else(|| ctx.business.as_ref().and_then(|b| b.tone.clone()))
            .unwrap_or_else(|| prompts::DEFAULT_TONE.to_string());
        let prompt = prompts::reply(
            &ctx.thread.subject,
            &ctx.messages,
            ctx.business.as_ref(),
            &tone,
        );
        let text = self
            .generate(
                "reply",
                GenerateRequest::new(prompt)
                    .with_temperature(0.7)
                    .with_max_tokens(140),
            )
            .await?;
        Ok(ReplyOutput {
            draft_text: text.trim().to_string(),
            tone_used: tone,
        })
    }

    /// Accepts either `{"tasks": [...]}` or a bare array.
    pub async fn extract_tasks(
        &self,
        user_id: &str,
        thread_id: Uuid,
    ) -> Result<Vec<ExtractedTask>, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        ctx.latest()?;
        let prompt = prompts::tasks(&ctx.thread.subject, &ctx.messages, ctx.business.as_ref());
        let raw = self
            .generate(
                "tasks",
                GenerateRequest::new(prompt)
                    .with_temperature(0.3)
                    .with_max_tokens(800)
                    .json(),
            )
            .await?;

        match parse_json_response(&raw)? {
            Value::Object(mut map) => match map.remove("tasks") {
                Some(tasks) => decode("tasks", tasks),
                None => Err(AiError::Parse("tasks response has no \"tasks\" field".to_string())),
            },
            array @ Value::Array(_) => decode("tasks", array),
            other => Err(AiError::Parse(format!("unexpected tasks response: {other}"))),
        }
    }

    pub async fn rewrite_reply(&self, draft: &str, instruction: &str) -> Result<String, AiError> {
        if draft.trim().is_empty() {
            return Err(AiError::Validation("draft is empty".to_string()));
        }
        if instruction.trim().is_empty() {
            return Err(AiError::Validation("instruction is empty".to_string()));
        }
        let text = self
            .generate(
                "rewrite",
                GenerateRequest::new(prompts::rewrite(draft, instruction))
                    .with_temperature(0.7)
                    .with_max_tokens(500),
            )
            .await?;
        Ok(text.trim().to_string())
    }

    pub async fn detect_escalation(
        &self,
        user_id: &str,
        thread_id: Uuid,
        sentiment: &SentimentOutput,
        priority: PriorityLevel,
    ) -> Result<EscalationOutput, AiError> {
        let ctx = self.thread_context(user_id, thread_id).await?;
        let prompt = prompts::escalation(
            &ctx.thread.subject,
            ctx.latest()?,
            sentiment,
            priority.as_str(),
        );
        self.generate_json(
            "escalation",
            GenerateRequest::new(prompt)
                .with_temperature(0.2)
                .with_max_tokens(300),
        )
        .await
    }
}

fn decode<T: DeserializeOwned>(task: &str, value: Value) -> Result<T, AiError> {
    serde_json::from_value(value)
        .map_err(|e| AiError::Parse(format!("{task} response has the wrong shape: {e}")))
}

/// Collapse runs of spaces and blank lines, then cut to `max_chars`.
fn clean_body(body: &str, max_chars: usize) -> String {
    let body = SPACES.replace_all(body, " ");
    let body = BLANK_LINES.replace_all(&body, "\n\n");
    let body = body.trim();
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let cut: String = body.chars().take(max_chars).collect();
    format!("{cut}{TRUNCATION_MARKER}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ai::AiTask;
    use crate::store::LibSqlStore;
    use crate::testing::{ScriptedLlm, llm_failure, seed_thread};

    fn config() -> AiConfig {
        AiConfig {
            retry_base_delay: Duration::from_secs(1),
            default_tasks: vec![AiTask::Summarize],
            ..AiConfig::default()
        }
    }

    async fn setup(llm: Arc<ScriptedLlm>) -> (AiOrchestrator, ThreadRecord) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let thread = seed_thread(
            store.as_ref(),
            "u1",
            "t1",
            &[
                ("customer@example.com", "Where is my   order?"),
                ("customer@example.com", "Still   waiting.\n\n\n\nPlease advise."),
            ],
        )
        .await;
        (AiOrchestrator::new(store, llm, &config()), thread)
    }

    #[test]
    fn clean_body_collapses_and_truncates() {
        assert_eq!(clean_body("a   b\t c", 100), "a b c");
        assert_eq!(clean_body("one\n\n\n\ntwo", 100), "one\n\ntwo");
        assert_eq!(clean_body("abcdefgh", 4), "abcd...[truncated]");
    }

    #[tokio::test]
    async fn context_orders_messages_and_cleans_bodies() {
        let (orch, thread) = setup(ScriptedLlm::always("ok")).await;
        let ctx = orch.thread_context("u1", thread.id).await.unwrap();
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].body, "Where is my order?");
        assert_eq!(ctx.messages[1].body, "Still waiting.\n\nPlease advise.");
    }

    #[tokio::test]
    async fn unknown_or_foreign_thread_fails_without_calling_llm() {
        let llm = ScriptedLlm::always("unused");
        let (orch, thread) = setup(llm.clone()).await;

        let err = orch.summarize_thread("u1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AiError::Validation(_)));
        let err = orch.summarize_thread("intruder", thread.id).await.unwrap_err();
        assert!(matches!(err, AiError::Validation(_)));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let llm = ScriptedLlm::new(vec![
            Err(llm_failure()),
            Err(llm_failure()),
            Ok("  Customer is waiting on order #1234.  ".to_string()),
        ]);
        let (orch, thread) = setup(llm.clone()).await;

        let started = tokio::time::Instant::now();
        let summary = orch.summarize_thread("u1", thread.id).await.unwrap();
        assert_eq!(summary, "Customer is waiting on order #1234.");
        assert_eq!(llm.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        let request = &llm.requests()[0];
        assert_eq!(request.temperature, 0.5);
        assert_eq!(request.max_tokens, 200);
        assert!(!request.json_mode);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_service_unavailable() {
        let llm = ScriptedLlm::new(vec![]);
        let (orch, thread) = setup(llm.clone()).await;

        let err = orch.summarize_thread("u1", thread.id).await.unwrap_err();
        assert!(matches!(err, AiError::ServiceUnavailable { attempts: 3, .. }));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn classify_parses_fenced_json() {
        let llm = ScriptedLlm::always(
            "```json\n{\"priority_level\": \"URGENT\", \"category\": \"delivery\", \"reasoning\": \"late\"}\n```",
        );
        let (orch, thread) = setup(llm.clone()).await;

        let priority = orch.classify_priority("u1", thread.id).await.unwrap();
        assert_eq!(priority.priority_level, PriorityLevel::Urgent);
        assert_eq!(priority.category, "delivery");
        assert!(llm.requests()[0].json_mode);
    }

    #[tokio::test]
    async fn unparseable_response_is_not_retried() {
        let llm = ScriptedLlm::always("I cannot classify this.");
        let (orch, thread) = setup(llm.clone()).await;

        let err = orch.classify_priority("u1", thread.id).await.unwrap_err();
        assert!(matches!(err, AiError::Parse(_)));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn sentiment_scores_are_clamped() {
        let llm = ScriptedLlm::always(
            r#"{"sentiment_score": -3.5, "sentiment_label": "negative", "anger_level": 1.7, "urgency_level": 0.4}"#,
        );
        let (orch, thread) = setup(llm).await;

        let sentiment = orch.analyze_sentiment("u1", thread.id).await.unwrap();
        assert_eq!(sentiment.sentiment_score, -1.0);
        assert_eq!(sentiment.anger_level, 1.0);
        assert_eq!(sentiment.urgency_level, 0.4);
    }

    #[tokio::test]
    async fn reply_uses_requested_tone() {
        let llm = ScriptedLlm::always("Your order ships tomorrow.");
        let (orch, thread) = setup(llm.clone()).await;

        let reply = orch.generate_reply("u1", thread.id, Some("warm")).await.unwrap();
        assert_eq!(reply.tone_used, "warm");
        assert_eq!(reply.draft_text, "Your order ships tomorrow.");
        assert!(llm.requests()[0].prompt.contains("Tone: warm"));

        let reply = orch.generate_reply("u1", thread.id, None).await.unwrap();
        assert_eq!(reply.tone_used, prompts::DEFAULT_TONE);
    }

    #[tokio::test]
    async fn tasks_accept_wrapped_or_bare_arrays() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"tasks": [{"title": "Ship order", "priority": "high"}]}"#.to_string()),
            Ok(r#"[{"title": "Refund"}, {"title": "Apologize"}]"#.to_string()),
        ]);
        let (orch, thread) = setup(llm).await;

        let tasks = orch.extract_tasks("u1", thread.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, "high");

        let tasks = orch.extract_tasks("u1", thread.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].priority, "medium");
    }

    #[tokio::test]
    async fn rewrite_validates_input() {
        let llm = ScriptedLlm::always("Hi! Your order is on its way.");
        let (orch, _) = setup(llm.clone()).await;

        assert!(matches!(
            orch.rewrite_reply("  ", "friendlier").await,
            Err(AiError::Validation(_))
        ));
        let text = orch
            .rewrite_reply("Your order shipped.", "more friendly")
            .await
            .unwrap();
        assert_eq!(text, "Hi! Your order is on its way.");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn escalation_prompt_carries_scores() {
        let llm = ScriptedLlm::always(
            r#"{"should_escalate": true, "reason": "angry", "suggested_owner": "support lead", "urgency_level": "high"}"#,
        );
        let (orch, thread) = setup(llm.clone()).await;
        let sentiment = SentimentOutput {
            sentiment_score: -0.8,
            sentiment_label: "negative".to_string(),
            anger_level: 0.9,
            urgency_level: 0.7,
            emotions: vec![],
            reasoning: String::new(),
        };

        let out = orch
            .detect_escalation("u1", thread.id, &sentiment, PriorityLevel::Customer)
            .await
            .unwrap();
        assert!(out.should_escalate);
        let prompt = &llm.requests()[0].prompt;
        assert!(prompt.contains("Anger Level: 0.90"));
        assert!(prompt.contains("Priority: customer"));
    }
}
