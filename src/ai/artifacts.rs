//! Persisted AI artifacts: generate once, reuse until regeneration is forced.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::orchestrator::AiOrchestrator;
use super::types::{AiTask, EscalationOutput, PriorityOutput, ReplyOutput, SentimentOutput};
use crate::error::AiError;
use crate::store::{Artifact, Store, TaskRecord};

/// What one AI task produced for a thread.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ArtifactOutput {
    Summary(Artifact<String>),
    Priority(Artifact<PriorityOutput>),
    Sentiment(Artifact<SentimentOutput>),
    Reply(Artifact<ReplyOutput>),
    Tasks(Vec<TaskRecord>),
    Escalation(EscalationOutput),
}

pub struct ArtifactService {
    store: Arc<dyn Store>,
    orchestrator: Arc<AiOrchestrator>,
}

impl ArtifactService {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<AiOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &AiOrchestrator {
        &self.orchestrator
    }

    /// Run one task for a thread the user owns.
    pub async fn process(
        &self,
        user_id: &str,
        thread_id: Uuid,
        task: AiTask,
        force_regenerate: bool,
    ) -> Result<ArtifactOutput, AiError> {
        self.check_owner(user_id, thread_id).await?;
        Ok(match task {
            AiTask::Summarize => {
                ArtifactOutput::Summary(self.summary(user_id, thread_id, force_regenerate).await?)
            }
            AiTask::Classify => {
                ArtifactOutput::Priority(self.priority(user_id, thread_id, force_regenerate).await?)
            }
            AiTask::Sentiment => ArtifactOutput::Sentiment(
                self.sentiment(user_id, thread_id, force_regenerate).await?,
            ),
            AiTask::Reply => {
                ArtifactOutput::Reply(self.reply(user_id, thread_id, force_regenerate).await?)
            }
            AiTask::Tasks => {
                ArtifactOutput::Tasks(self.tasks(user_id, thread_id, force_regenerate).await?)
            }
            AiTask::Escalation => {
                ArtifactOutput::Escalation(self.escalation(user_id, thread_id).await?)
            }
        })
    }

    async fn check_owner(&self, user_id: &str, thread_id: Uuid) -> Result<(), AiError> {
        match self.store.get_thread(thread_id).await? {
            Some(thread) if thread.user_id == user_id => Ok(()),
            _ => Err(AiError::Validation(format!("thread {thread_id} not found"))),
        }
    }

    async fn summary(
        &self,
        user_id: &str,
        thread_id: Uuid,
        force: bool,
    ) -> Result<Artifact<String>, AiError> {
        if !force && let Some(existing) = self.store.get_summary(thread_id).await? {
            debug!(thread_id = %thread_id, "Reusing stored summary");
            return Ok(existing);
        }
        let text = self.orchestrator.summarize_thread(user_id, thread_id).await?;
        let stored = self
            .store
            .upsert_summary(thread_id, &text, &self.orchestrator.model_name())
            .await?;
        info!(thread_id = %thread_id, task = "summarize", "Artifact generated");
        Ok(stored)
    }

    async fn priority(
        &self,
        user_id: &str,
        thread_id: Uuid,
        force: bool,
    ) -> Result<Artifact<PriorityOutput>, AiError> {
        if !force && let Some(existing) = self.store.get_priority(thread_id).await? {
            debug!(thread_id = %thread_id, "Reusing stored priority");
            return Ok(existing);
        }
        let priority = self.orchestrator.classify_priority(user_id, thread_id).await?;
        let stored = self
            .store
            .upsert_priority(thread_id, &priority, &self.orchestrator.model_name())
            .await?;
        info!(
            thread_id = %thread_id,
            task = "classify",
            level = %priority.priority_level,
            "Artifact generated"
        );
        Ok(stored)
    }

    async fn sentiment(
        &self,
        user_id: &str,
        thread_id: Uuid,
        force: bool,
    ) -> Result<Artifact<SentimentOutput>, AiError> {
        if !force && let Some(existing) = self.store.get_sentiment(thread_id).await? {
            debug!(thread_id = %thread_id, "Reusing stored sentiment");
            return Ok(existing);
        }
        let sentiment = self.orchestrator.analyze_sentiment(user_id, thread_id).await?;
        let stored = self
            .store
            .upsert_sentiment(thread_id, &sentiment, &self.orchestrator.model_name())
            .await?;
        info!(thread_id = %thread_id, task = "sentiment", "Artifact generated");
        Ok(stored)
    }

    async fn reply(
        &self,
        user_id: &str,
        thread_id: Uuid,
        force: bool,
    ) -> Result<Artifact<ReplyOutput>, AiError> {
        if !force && let Some(existing) = self.store.get_reply_draft(thread_id).await? {
            debug!(thread_id = %thread_id, "Reusing stored reply draft");
            return Ok(existing);
        }
        let reply = self
            .orchestrator
            .generate_reply(user_id, thread_id, None)
            .await?;
        let stored = self
            .store
            .upsert_reply_draft(thread_id, &reply, &self.orchestrator.model_name())
            .await?;
        info!(thread_id = %thread_id, task = "reply", "Artifact generated");
        Ok(stored)
    }

    async fn tasks(
        &self,
        user_id: &str,
        thread_id: Uuid,
        force: bool,
    ) -> Result<Vec<TaskRecord>, AiError> {
        if !force {
            let existing = self.store.list_tasks(thread_id).await?;
            if !existing.is_empty() {
                debug!(thread_id = %thread_id, count = existing.len(), "Reusing stored tasks");
                return Ok(existing);
            }
        }
        let tasks = self.orchestrator.extract_tasks(user_id, thread_id).await?;
        let stored = self
            .store
            .replace_tasks(thread_id, &tasks, &self.orchestrator.model_name())
            .await?;
        info!(thread_id = %thread_id, task = "tasks", count = stored.len(), "Artifact generated");
        Ok(stored)
    }

    /// Computed from the stored (or freshly generated) priority and sentiment.
    async fn escalation(&self, user_id: &str, thread_id: Uuid) -> Result<EscalationOutput, AiError> {
        let priority = self.priority(user_id, thread_id, false).await?;
        let sentiment = self.sentiment(user_id, thread_id, false).await?;
        let escalation = self
            .orchestrator
            .detect_escalation(
                user_id,
                thread_id,
                &sentiment.data,
                priority.data.priority_level,
            )
            .await?;
        info!(
            thread_id = %thread_id,
            should_escalate = escalation.should_escalate,
            "Escalation checked"
        );
        Ok(escalation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::PriorityLevel;
    use crate::config::AiConfig;
    use crate::store::{LibSqlStore, ThreadRecord};
    use crate::testing::{ScriptedLlm, seed_thread};

    async fn setup(llm: Arc<ScriptedLlm>) -> (ArtifactService, Arc<dyn Store>, ThreadRecord) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let thread = seed_thread(
            store.as_ref(),
            "u1",
            "t1",
            &[("customer@example.com", "My package never arrived. Ship it by Friday!")],
        )
        .await;
        let orchestrator = Arc::new(AiOrchestrator::new(
            store.clone(),
            llm,
            &AiConfig::default(),
        ));
        (
            ArtifactService::new(store.clone(), orchestrator),
            store,
            thread,
        )
    }

    #[tokio::test]
    async fn stored_summary_is_reused_until_forced() {
        let llm = ScriptedLlm::new(vec![Ok("first".to_string()), Ok("second".to_string())]);
        let (service, store, thread) = setup(llm.clone()).await;

        let out = service.process("u1", thread.id, AiTask::Summarize, false).await.unwrap();
        assert!(matches!(out, ArtifactOutput::Summary(ref a) if a.data == "first"));
        service.process("u1", thread.id, AiTask::Summarize, false).await.unwrap();
        assert_eq!(llm.calls(), 1);

        service.process("u1", thread.id, AiTask::Summarize, true).await.unwrap();
        assert_eq!(llm.calls(), 2);
        let stored = store.get_summary(thread.id).await.unwrap().unwrap();
        assert_eq!(stored.data, "second");
        assert_eq!(stored.model, "scripted-test");
    }

    #[tokio::test]
    async fn forced_tasks_replace_previous_list() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"tasks": [{"title": "Ship"}, {"title": "Refund"}]}"#.to_string()),
            Ok(r#"{"tasks": [{"title": "Apologize"}]}"#.to_string()),
        ]);
        let (service, store, thread) = setup(llm).await;

        service.process("u1", thread.id, AiTask::Tasks, false).await.unwrap();
        service.process("u1", thread.id, AiTask::Tasks, true).await.unwrap();

        let tasks = store.list_tasks(thread.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task.title, "Apologize");
    }

    #[tokio::test]
    async fn escalation_reuses_stored_priority() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"sentiment_score": -0.9, "anger_level": 0.8, "urgency_level": 0.9}"#.to_string()),
            Ok(r#"{"should_escalate": true, "reason": "angry customer", "suggested_owner": "support", "urgency_level": "high"}"#.to_string()),
        ]);
        let (service, store, thread) = setup(llm.clone()).await;
        store
            .upsert_priority(
                thread.id,
                &PriorityOutput {
                    priority_level: PriorityLevel::Urgent,
                    category: "delivery".to_string(),
                    reasoning: String::new(),
                },
                "earlier-model",
            )
            .await
            .unwrap();

        let out = service.process("u1", thread.id, AiTask::Escalation, false).await.unwrap();
        let ArtifactOutput::Escalation(escalation) = out else {
            panic!("expected escalation output");
        };
        assert!(escalation.should_escalate);
        assert_eq!(llm.calls(), 2);
        assert!(llm.requests()[1].prompt.contains("Priority: urgent"));
    }

    #[tokio::test]
    async fn other_users_cannot_read_artifacts() {
        let (service, store, thread) = setup(ScriptedLlm::always("unused")).await;
        store.upsert_summary(thread.id, "private", "m").await.unwrap();

        let err = service
            .process("someone-else", thread.id, AiTask::Summarize, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Validation(_)));
    }
}
