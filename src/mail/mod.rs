//! Mail provider abstraction and sync.
//!
//! Gmail and Outlook are reached through one [`MailProvider`] interface.
//! Each adapter normalizes its wire format into [`NormalizedMessage`], and a
//! [`ProviderRegistry`] maps a [`ProviderKind`] to the adapter constructor.

pub mod gmail;
pub mod html;
pub mod outlook;
pub mod reply;
pub mod resolve;
pub mod sync;

pub use gmail::GmailClient;
pub use outlook::OutlookClient;
pub use reply::{ReplySender, SentReply};
pub use resolve::{Resolution, ResolvedThread, ThreadResolver};
pub use sync::{MailSync, SyncStats, UserSyncReport};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::error::MailError;

/// Supported mail providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Outlook,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "microsoft" => Ok(Self::Outlook),
            other => Err(MailError::Unsupported(other.to_string())),
        }
    }
}

/// A connected mailbox. The access token is issued elsewhere.
#[derive(Debug, Clone)]
pub struct MailAccount {
    pub user_id: String,
    pub provider: ProviderKind,
    pub email_address: String,
    pub access_token: SecretString,
}

/// Provider-independent view of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// RFC 5322 `Message-ID`.
    pub internet_message_id: Option<String>,
    pub body_text: String,
    pub body_html: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only messages received after this instant.
    pub since: Option<DateTime<Utc>>,
    pub max_results: u32,
}

/// Message ids of one provider thread under its canonical id.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadListing {
    pub canonical_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    /// Provider thread to reply into.
    pub thread_id: Option<String>,
}

/// List, fetch, canonicalize and send against one mailbox.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn list_message_ids(&self, query: &ListQuery) -> Result<Vec<String>, MailError>;

    async fn get_message(&self, message_id: &str) -> Result<NormalizedMessage, MailError>;

    /// Authoritative id for a possibly aliased thread id; `None` if the
    /// provider does not know the thread.
    async fn canonical_thread_id(&self, thread_id: &str) -> Result<Option<String>, MailError>;

    async fn thread_message_ids(&self, thread_id: &str)
    -> Result<Option<ThreadListing>, MailError>;

    /// Returns the provider id of the sent message when the API reports one.
    async fn send_message(&self, mail: &OutgoingMail) -> Result<Option<String>, MailError>;
}

/// `base` with `segments` appended, each escaped as a single path segment.
pub(crate) fn endpoint(
    provider: &str,
    base: &str,
    segments: &[&str],
) -> Result<reqwest::Url, MailError> {
    let invalid = |reason: String| MailError::Http {
        provider: provider.to_string(),
        reason,
    };
    let mut url =
        reqwest::Url::parse(base).map_err(|e| invalid(format!("invalid base URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| invalid(format!("base URL {base} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Builds a provider client for an account.
pub trait MailProviderFactory: Send + Sync {
    fn client_for(&self, account: &MailAccount) -> Result<Arc<dyn MailProvider>, MailError>;
}

type Constructor = Box<dyn Fn(&MailAccount) -> Arc<dyn MailProvider> + Send + Sync>;

/// Discriminator to constructor map.
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: HashMap<ProviderKind, Constructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the HTTP adapters for every supported provider.
    pub fn with_http(http: reqwest::Client, config: &SyncConfig) -> Self {
        let mut registry = Self::new();
        let (gmail_http, gmail_base) = (http.clone(), config.gmail_api_base.clone());
        registry.register(ProviderKind::Gmail, move |account: &MailAccount| -> Arc<dyn MailProvider> {
            Arc::new(GmailClient::new(
                gmail_http.clone(),
                &gmail_base,
                account.access_token.clone(),
            ))
        });
        let graph_base = config.graph_api_base.clone();
        registry.register(ProviderKind::Outlook, move |account: &MailAccount| -> Arc<dyn MailProvider> {
            Arc::new(OutlookClient::new(
                http.clone(),
                &graph_base,
                account.access_token.clone(),
            ))
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ProviderKind, constructor: F)
    where
        F: Fn(&MailAccount) -> Arc<dyn MailProvider> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Box::new(constructor));
    }
}

impl MailProviderFactory for ProviderRegistry {
    fn client_for(&self, account: &MailAccount) -> Result<Arc<dyn MailProvider>, MailError> {
        self.constructors
            .get(&account.provider)
            .map(|build| build(account))
            .ok_or_else(|| MailError::Unsupported(account.provider.to_string()))
    }
}
