//! Test doubles shared by unit tests: a scripted LLM, an in-memory mailbox
//! and a factory that hands the mailbox out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;

use crate::error::{LlmError, MailError};
use crate::llm::{GenerateRequest, LlmProvider};
use crate::mail::{
    ListQuery, MailAccount, MailProvider, MailProviderFactory, NormalizedMessage, OutgoingMail,
    ProviderKind, ThreadListing,
};
use crate::store::{NewMessage, NewThread, Store, ThreadRecord};

// ── LLM ─────────────────────────────────────────────────────────────

/// Replies from a queue, then from `fallback` once the queue is drained.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn always(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn llm_failure() -> LlmError {
    LlmError::RequestFailed {
        provider: "scripted".to_string(),
        reason: "HTTP 503".to_string(),
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> String {
        "scripted-test".to_string()
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => self.fallback.clone().ok_or_else(llm_failure),
        }
    }
}

// ── Mail ────────────────────────────────────────────────────────────

/// An in-memory mailbox for one provider.
pub struct FakeMailbox {
    kind: ProviderKind,
    messages: Mutex<Vec<NormalizedMessage>>,
    failing: Mutex<HashSet<String>>,
    aliases: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<OutgoingMail>>,
}

impl FakeMailbox {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            messages: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            aliases: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, message: NormalizedMessage) {
        self.messages.lock().unwrap().push(message);
    }

    /// `get_message` for this id fails with an HTTP error.
    pub fn fail_on(&self, message_id: &str) {
        self.failing.lock().unwrap().insert(message_id.to_string());
    }

    pub fn alias(&self, alias: &str, canonical: &str) {
        self.aliases
            .lock()
            .unwrap()
            .insert(alias.to_string(), canonical.to_string());
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailProvider for FakeMailbox {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_message_ids(&self, query: &ListQuery) -> Result<Vec<String>, MailError> {
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| match (query.since, m.date) {
                (Some(since), Some(date)) => date >= since,
                _ => true,
            })
            .take(query.max_results as usize)
            .map(|m| m.provider_message_id.clone())
            .collect())
    }

    async fn get_message(&self, message_id: &str) -> Result<NormalizedMessage, MailError> {
        if self.failing.lock().unwrap().contains(message_id) {
            return Err(MailError::Http {
                provider: self.kind.to_string(),
                reason: format!("HTTP 500 for {message_id}"),
            });
        }
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.provider_message_id == message_id)
            .cloned()
            .ok_or_else(|| MailError::Http {
                provider: self.kind.to_string(),
                reason: format!("HTTP 404 for {message_id}"),
            })
    }

    async fn canonical_thread_id(&self, thread_id: &str) -> Result<Option<String>, MailError> {
        if let Some(canonical) = self.aliases.lock().unwrap().get(thread_id) {
            return Ok(Some(canonical.clone()));
        }
        let known = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.provider_thread_id == thread_id);
        Ok(known.then(|| thread_id.to_string()))
    }

    async fn thread_message_ids(
        &self,
        thread_id: &str,
    ) -> Result<Option<ThreadListing>, MailError> {
        let Some(canonical_id) = self.canonical_thread_id(thread_id).await? else {
            return Ok(None);
        };
        let message_ids = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.provider_thread_id == canonical_id)
            .map(|m| m.provider_message_id.clone())
            .collect();
        Ok(Some(ThreadListing {
            canonical_id,
            message_ids,
        }))
    }

    async fn send_message(&self, mail: &OutgoingMail) -> Result<Option<String>, MailError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail.clone());
        Ok(Some(format!("sent-{}", sent.len())))
    }
}

/// Hands out fake mailboxes by provider kind.
#[derive(Default)]
pub struct FakeFactory {
    mailboxes: HashMap<ProviderKind, Arc<FakeMailbox>>,
}

impl FakeFactory {
    pub fn with(mut self, mailbox: Arc<FakeMailbox>) -> Self {
        self.mailboxes.insert(mailbox.kind, mailbox);
        self
    }
}

impl MailProviderFactory for FakeFactory {
    fn client_for(&self, account: &MailAccount) -> Result<Arc<dyn MailProvider>, MailError> {
        self.mailboxes
            .get(&account.provider)
            .map(|m| Arc::clone(m) as Arc<dyn MailProvider>)
            .ok_or_else(|| MailError::Unsupported(account.provider.to_string()))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn account(user_id: &str, provider: ProviderKind) -> MailAccount {
    MailAccount {
        user_id: user_id.to_string(),
        provider,
        email_address: format!("{user_id}@example.com"),
        access_token: SecretString::from("token".to_string()),
    }
}

/// 2025-01-14 at the given hour, UTC.
pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 14, hour, 0, 0).unwrap()
}

pub fn message(id: &str, thread_id: &str, hour: u32, body: &str) -> NormalizedMessage {
    NormalizedMessage {
        provider_message_id: id.to_string(),
        provider_thread_id: thread_id.to_string(),
        subject: "Order #1234".to_string(),
        from: "customer@example.com".to_string(),
        to: vec!["support@example.com".to_string()],
        cc: vec![],
        date: Some(at(hour)),
        internet_message_id: Some(format!("<{id}@example.com>")),
        body_text: body.to_string(),
        body_html: None,
    }
}

/// A stored Gmail thread with one message per `(from, body)` pair, one hour apart.
pub async fn seed_thread(
    store: &dyn Store,
    user_id: &str,
    provider_thread_id: &str,
    messages: &[(&str, &str)],
) -> ThreadRecord {
    let last = at(8 + messages.len() as u32);
    let thread = store
        .upsert_thread(&NewThread {
            user_id: user_id.to_string(),
            provider: ProviderKind::Gmail,
            provider_thread_id: provider_thread_id.to_string(),
            subject: "Order #1234".to_string(),
            last_message_at: last,
        })
        .await
        .unwrap()
        .thread;
    for (i, (from, body)) in messages.iter().enumerate() {
        store
            .insert_message(&NewMessage {
                thread_id: thread.id,
                provider: ProviderKind::Gmail,
                provider_message_id: format!("{provider_thread_id}-m{i}"),
                subject: "Order #1234".to_string(),
                from_address: from.to_string(),
                to_addresses: vec!["support@example.com".to_string()],
                cc_addresses: vec![],
                sent_at: at(9 + i as u32),
                internet_message_id: None,
                body_text: body.to_string(),
            })
            .await
            .unwrap();
    }
    thread
}
