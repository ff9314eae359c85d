//! Send a reply into a stored thread through the thread's own provider.
//!
//! The body is either given by the caller or taken from the thread's stored
//! reply draft. Recipients come from the latest message in the thread.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{MailAccount, MailProviderFactory, OutgoingMail, ProviderKind};
use crate::error::MailError;
use crate::store::{MessageRecord, Store, ThreadRecord};

/// What was sent.
#[derive(Debug, Clone, Serialize)]
pub struct SentReply {
    pub thread_id: Uuid,
    pub provider: ProviderKind,
    pub to: Vec<String>,
    pub subject: String,
    /// Provider id of the sent message, when the API reports one.
    pub message_id: Option<String>,
    /// `true` when the body came from the stored reply draft.
    pub used_draft: bool,
}

pub struct ReplySender {
    store: Arc<dyn Store>,
    providers: Arc<dyn MailProviderFactory>,
}

impl ReplySender {
    pub fn new(store: Arc<dyn Store>, providers: Arc<dyn MailProviderFactory>) -> Self {
        Self { store, providers }
    }

    /// Reply to `thread_id` as `user_id`.
    ///
    /// A blank or missing `body` falls back to the stored reply draft.
    pub async fn send_reply(
        &self,
        user_id: &str,
        thread_id: Uuid,
        body: Option<&str>,
    ) -> Result<SentReply, MailError> {
        let thread = self
            .store
            .get_thread(thread_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| MailError::ThreadNotFound(thread_id.to_string()))?;

        let (body_text, used_draft) = match body.map(str::trim).filter(|b| !b.is_empty()) {
            Some(body) => (body.to_string(), false),
            None => {
                let draft = self
                    .store
                    .get_reply_draft(thread.id)
                    .await?
                    .map(|a| a.data.draft_text)
                    .filter(|d| !d.trim().is_empty())
                    .ok_or_else(|| MailError::EmptyReply(thread_id.to_string()))?;
                (draft, true)
            }
        };

        let account = self
            .store
            .list_accounts(user_id)
            .await?
            .into_iter()
            .find(|a| a.provider == thread.provider)
            .ok_or_else(|| MailError::NotConnected {
                user_id: user_id.to_string(),
                provider: thread.provider.to_string(),
            })?;

        let messages = self.store.list_thread_messages(thread.id).await?;
        let latest = messages
            .last()
            .ok_or_else(|| MailError::ThreadNotFound(thread_id.to_string()))?;

        let mail = OutgoingMail {
            from: account.email_address.clone(),
            to: reply_recipients(latest, &account),
            cc: Vec::new(),
            subject: reply_subject(&thread),
            body_text,
            thread_id: Some(thread.provider_thread_id.clone()),
        };
        let client = self.providers.client_for(&account)?;
        let message_id = client.send_message(&mail).await?;

        info!(
            user_id,
            thread_id = %thread.id,
            provider = %thread.provider,
            recipients = mail.to.len(),
            used_draft,
            "Reply sent"
        );
        Ok(SentReply {
            thread_id: thread.id,
            provider: thread.provider,
            to: mail.to,
            subject: mail.subject,
            message_id,
            used_draft,
        })
    }
}

/// The sender of `latest`, or its recipients when the account sent it.
fn reply_recipients(latest: &MessageRecord, account: &MailAccount) -> Vec<String> {
    let own = account.email_address.to_lowercase();
    if !latest.from_address.to_lowercase().contains(&own) {
        return vec![latest.from_address.clone()];
    }
    latest
        .to_addresses
        .iter()
        .filter(|a| !a.to_lowercase().contains(&own))
        .cloned()
        .collect()
}

fn reply_subject(thread: &ThreadRecord) -> String {
    let subject = thread.subject.trim();
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}
