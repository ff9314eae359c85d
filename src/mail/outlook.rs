//! Microsoft Graph (Outlook) adapter.
//!
//! Graph threads are conversations. A `conversationId` is already the
//! canonical id, so canonicalization only checks that it still has messages.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::html::html_to_text;
use super::{
    ListQuery, MailProvider, NormalizedMessage, OutgoingMail, ProviderKind, ThreadListing,
    endpoint,
};
use crate::error::MailError;

const PROVIDER: &str = "outlook";
const PAGE_SIZE: u32 = 100;

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    value: Vec<MessageRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

/// The subset of a Graph `message` resource the sync needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub id: String,
    pub conversation_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(default)]
    pub cc_recipients: Vec<Recipient>,
    pub received_date_time: Option<DateTime<Utc>>,
    pub sent_date_time: Option<DateTime<Utc>>,
    pub internet_message_id: Option<String>,
    pub body: Option<ItemBody>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMailRequest {
    message: OutgoingGraphMessage,
    save_to_sent_items: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingGraphMessage {
    subject: String,
    body: ItemBody,
    to_recipients: Vec<Recipient>,
    cc_recipients: Vec<Recipient>,
}

pub struct OutlookClient {
    http: Client,
    base_url: String,
    token: SecretString,
}

impl OutlookClient {
    pub fn new(http: Client, base_url: &str, token: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn get_url(&self, url: &str, query: &[(&str, String)]) -> Result<Response, MailError> {
        self.http
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(request_error)
    }

    /// Follow `@odata.nextLink` from `first` until `limit` ids are collected.
    async fn collect_ids(&self, first: Response, limit: usize) -> Result<Vec<String>, MailError> {
        let mut ids = Vec::new();
        let mut res = first;
        loop {
            let page: ListResponse = ok_or_status(res).await?.json().await.map_err(decode_error)?;
            ids.extend(page.value.into_iter().map(|m| m.id));
            match page.next_link {
                Some(next) if ids.len() < limit => {
                    // nextLink already carries every query parameter.
                    res = self.get_url(&next, &[]).await?;
                }
                _ => break,
            }
        }
        ids.truncate(limit);
        Ok(ids)
    }
}

#[async_trait]
impl MailProvider for OutlookClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn list_message_ids(&self, query: &ListQuery) -> Result<Vec<String>, MailError> {
        let mut params = vec![
            ("$top", query.max_results.clamp(1, PAGE_SIZE).to_string()),
            ("$select", "id".to_string()),
            ("$orderby", "receivedDateTime desc".to_string()),
        ];
        if let Some(since) = query.since {
            params.push(("$filter", received_since_filter(since)));
        }
        let url = format!("{}/me/messages", self.base_url);
        let res = self.get_url(&url, &params).await?;
        self.collect_ids(res, query.max_results as usize).await
    }

    async fn get_message(&self, message_id: &str) -> Result<NormalizedMessage, MailError> {
        let url = endpoint(PROVIDER, &self.base_url, &["me", "messages", message_id])?;
        let res = self.get_url(url.as_str(), &[]).await?;
        let message: GraphMessage = ok_or_status(res).await?.json().await.map_err(decode_error)?;
        normalize_graph_message(message)
    }

    async fn canonical_thread_id(&self, thread_id: &str) -> Result<Option<String>, MailError> {
        Ok(self
            .thread_message_ids(thread_id)
            .await?
            .map(|listing| listing.canonical_id))
    }

    async fn thread_message_ids(
        &self,
        thread_id: &str,
    ) -> Result<Option<ThreadListing>, MailError> {
        let params = vec![
            ("$filter", format!("conversationId eq '{}'", thread_id.replace('\'', "''"))),
            ("$select", "id".to_string()),
            ("$top", PAGE_SIZE.to_string()),
        ];
        let url = format!("{}/me/messages", self.base_url);
        let res = self.get_url(&url, &params).await?;
        if matches!(res.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        let ids = self.collect_ids(res, usize::MAX).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(ThreadListing {
            canonical_id: thread_id.to_string(),
            message_ids: ids,
        }))
    }

    async fn send_message(&self, mail: &OutgoingMail) -> Result<Option<String>, MailError> {
        let body = SendMailRequest {
            message: OutgoingGraphMessage {
                subject: mail.subject.clone(),
                body: ItemBody {
                    content_type: "Text".to_string(),
                    content: mail.body_text.clone(),
                },
                to_recipients: mail.to.iter().map(|a| recipient(a)).collect(),
                cc_recipients: mail.cc.iter().map(|a| recipient(a)).collect(),
            },
            save_to_sent_items: true,
        };
        let res = self
            .http
            .post(format!("{}/me/sendMail", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        ok_or_status(res).await?;
        tracing::info!(recipients = mail.to.len(), "Sent Outlook message");
        // sendMail answers 202 with no body, so there is no message id to report.
        Ok(None)
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// OData filter for messages received at or after `since`.
pub fn received_since_filter(since: DateTime<Utc>) -> String {
    format!(
        "receivedDateTime ge {}",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Map a Graph message onto the normalized shape.
pub fn normalize_graph_message(message: GraphMessage) -> Result<NormalizedMessage, MailError> {
    let thread_id = message.conversation_id.ok_or_else(|| MailError::Decode {
        provider: PROVIDER.to_string(),
        reason: format!("message {} has no conversationId", message.id),
    })?;

    let (body_text, body_html) = match message.body {
        Some(body) if body.content_type.eq_ignore_ascii_case("html") => {
            (html_to_text(&body.content), Some(body.content))
        }
        Some(body) => (body.content, None),
        None => (String::new(), None),
    };

    let subject = message
        .subject
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "(No subject)".to_string());

    Ok(NormalizedMessage {
        provider_message_id: message.id,
        provider_thread_id: thread_id,
        subject,
        from: message
            .from
            .and_then(|r| r.email_address.address)
            .unwrap_or_else(|| "unknown".to_string()),
        to: addresses(message.to_recipients),
        cc: addresses(message.cc_recipients),
        date: message.received_date_time.or(message.sent_date_time),
        internet_message_id: message.internet_message_id,
        body_text,
        body_html,
    })
}

fn addresses(recipients: Vec<Recipient>) -> Vec<String> {
    recipients
        .into_iter()
        .filter_map(|r| r.email_address.address)
        .collect()
}

fn recipient(address: &str) -> Recipient {
    Recipient {
        email_address: EmailAddress {
            name: None,
            address: Some(address.to_string()),
        },
    }
}

async fn ok_or_status(res: Response) -> Result<Response, MailError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(MailError::Http {
        provider: PROVIDER.to_string(),
        reason: format!("HTTP {status}: {}", body.chars().take(300).collect::<String>()),
    })
}

fn request_error(e: reqwest::Error) -> MailError {
    MailError::Http {
        provider: PROVIDER.to_string(),
        reason: e.without_url().to_string(),
    }
}

fn decode_error(e: reqwest::Error) -> MailError {
    MailError::Decode {
        provider: PROVIDER.to_string(),
        reason: e.without_url().to_string(),
    }
}
