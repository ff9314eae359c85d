//! Gmail REST adapter.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use lettre::Message;
use mail_parser::{MessageParser, MimeHeaders};
use reqwest::{Client, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::html::html_to_text;
use super::{
    ListQuery, MailProvider, NormalizedMessage, OutgoingMail, ProviderKind, ThreadListing,
    endpoint,
};
use crate::error::MailError;

const PROVIDER: &str = "gmail";
/// Gmail caps `maxResults` per page.
const PAGE_SIZE: u32 = 500;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    thread_id: String,
    raw: String,
}

#[derive(Deserialize)]
struct ThreadResponse {
    id: String,
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

pub struct GmailClient {
    http: Client,
    base_url: String,
    token: SecretString,
}

impl GmailClient {
    pub fn new(http: Client, base_url: &str, token: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// `{base}/users/me/` followed by `segments`.
    fn url(&self, segments: &[&str]) -> Result<Url, MailError> {
        let path: Vec<&str> = ["users", "me"].iter().chain(segments).copied().collect();
        endpoint(PROVIDER, &self.base_url, &path)
    }

    async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Response, MailError> {
        self.http
            .get(self.url(segments)?)
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(request_error)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn list_message_ids(&self, query: &ListQuery) -> Result<Vec<String>, MailError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let limit = query.max_results as usize;

        loop {
            let remaining = limit.saturating_sub(ids.len()) as u32;
            let mut params = vec![("maxResults", remaining.min(PAGE_SIZE).to_string())];
            if let Some(since) = query.since {
                params.push(("q", after_query(since)));
            }
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let res = ok_or_status(self.get(&["messages"], &params).await?).await?;
            let page: ListResponse = res.json().await.map_err(decode_error)?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if ids.len() < limit => page_token = Some(token),
                _ => break,
            }
        }
        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_message(&self, message_id: &str) -> Result<NormalizedMessage, MailError> {
        let res = self
            .get(&["messages", message_id], &[("format", "raw".to_string())])
            .await?;
        let raw: RawMessage = ok_or_status(res).await?.json().await.map_err(decode_error)?;
        let bytes = decode_base64url(&raw.raw)?;
        normalize_raw_message(&raw.id, &raw.thread_id, &bytes)
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
        let res = self
            .get(&["threads", thread_id], &[("format", "minimal".to_string())])
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let thread: ThreadResponse = ok_or_status(res).await?.json().await.map_err(decode_error)?;
        Ok(Some(ThreadListing {
            canonical_id: thread.id,
            message_ids: thread.messages.into_iter().map(|m| m.id).collect(),
        }))
    }

    async fn send_message(&self, mail: &OutgoingMail) -> Result<Option<String>, MailError> {
        let rfc822 = build_rfc822(mail)?;
        let body = SendRequest {
            raw: URL_SAFE_NO_PAD.encode(rfc822),
            thread_id: mail.thread_id.as_deref(),
        };
        let res = self
            .http
            .post(self.url(&["messages", "send"])?)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let sent: SendResponse = ok_or_status(res).await?.json().await.map_err(decode_error)?;
        tracing::info!(message_id = %sent.id, "Sent Gmail message");
        Ok(Some(sent.id))
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Gmail search clause for messages received after `since`.
pub fn after_query(since: DateTime<Utc>) -> String {
    format!("after:{}", since.format("%Y/%m/%d"))
}

/// Decode Gmail's base64url payload, padded or not.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, MailError> {
    URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .map_err(|e| MailError::Decode {
            provider: PROVIDER.to_string(),
            reason: format!("base64: {e}"),
        })
}

/// Parse an RFC 822 message into the normalized shape.
pub fn normalize_raw_message(
    message_id: &str,
    thread_id: &str,
    raw: &[u8],
) -> Result<NormalizedMessage, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Decode {
            provider: PROVIDER.to_string(),
            reason: format!("message {message_id} is not valid RFC 822"),
        })?;

    let from = extract_addresses(parsed.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| "unknown".to_string());
    let body_html = parsed
        .html_part(0)
        .filter(|part| is_html(part))
        .and_then(|part| part.text_contents())
        .map(str::to_string);
    let plain = parsed
        .text_part(0)
        .filter(|part| !is_html(part))
        .and_then(|part| part.text_contents());
    let body_text = match plain {
        Some(text) if !text.trim().is_empty() => text.trim_end().to_string(),
        _ => body_html.as_deref().map(html_to_text).unwrap_or_default(),
    };

    Ok(NormalizedMessage {
        provider_message_id: message_id.to_string(),
        provider_thread_id: thread_id.to_string(),
        subject: parsed.subject().unwrap_or("(No subject)").to_string(),
        from,
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        date: parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
        internet_message_id: parsed.message_id().map(|s| s.to_string()),
        body_text,
        body_html,
    })
}

fn is_html(part: &mail_parser::MessagePart) -> bool {
    MimeHeaders::content_type(part).is_some_and(|ct| {
        ct.ctype().eq_ignore_ascii_case("text")
            && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("html"))
    })
}

fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn build_rfc822(mail: &OutgoingMail) -> Result<Vec<u8>, MailError> {
    let invalid = |what: &str, e: String| MailError::Decode {
        provider: PROVIDER.to_string(),
        reason: format!("Invalid {what} address: {e}"),
    };

    let mut builder = Message::builder()
        .from(mail.from.parse().map_err(|e| invalid("from", format!("{e}")))?)
        .subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(to.parse().map_err(|e| invalid("to", format!("{e}")))?);
    }
    for cc in &mail.cc {
        builder = builder.cc(cc.parse().map_err(|e| invalid("cc", format!("{e}")))?);
    }
    let message = builder
        .body(mail.body_text.clone())
        .map_err(|e| MailError::Decode {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to build email: {e}"),
        })?;
    Ok(message.formatted())
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

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const RAW: &str = "From: Alice <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Subject: Invoice overdue\r\n\
Date: Tue, 14 Jan 2025 10:30:00 +0000\r\n\
Message-ID: <abc123@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please pay invoice 42.\r\n";

    #[test]
    fn normalizes_plain_text_message() {
        let msg = normalize_raw_message("m1", "t1", RAW.as_bytes()).unwrap();
        assert_eq!(msg.provider_message_id, "m1");
        assert_eq!(msg.provider_thread_id, "t1");
        assert_eq!(msg.subject, "Invoice overdue");
        assert_eq!(msg.from, "alice@example.com");
        assert_eq!(msg.to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(msg.cc, vec!["dave@example.com"]);
        assert_eq!(msg.internet_message_id.as_deref(), Some("abc123@example.com"));
        assert_eq!(
            msg.date,
            Some(Utc.with_ymd_and_hms(2025, 1, 14, 10, 30, 0).unwrap())
        );
        assert!(msg.body_text.contains("Please pay invoice 42."));
        assert!(msg.body_html.is_none());
    }

    #[test]
    fn html_only_message_gets_text_body() {
        let raw = "From: a@example.com\r\n\
Subject: Hi\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello <b>there</b></p></body></html>\r\n";
        let msg = normalize_raw_message("m2", "t2", raw.as_bytes()).unwrap();
        assert_eq!(msg.body_text, "Hello there");
        assert!(msg.body_html.is_some());
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let raw = "From: a@example.com\r\n\r\nbody\r\n";
        let msg = normalize_raw_message("m3", "t3", raw.as_bytes()).unwrap();
        assert_eq!(msg.subject, "(No subject)");
    }

    #[test]
    fn base64url_accepts_padding() {
        let encoded = URL_SAFE_NO_PAD.encode(b"hello?>");
        assert_eq!(decode_base64url(&encoded).unwrap(), b"hello?>");
        assert_eq!(decode_base64url("aGk=").unwrap(), b"hi");
        assert!(decode_base64url("***").is_err());
    }

    #[test]
    fn after_query_uses_gmail_date_format() {
        let since = Utc.with_ymd_and_hms(2025, 3, 7, 18, 0, 0).unwrap();
        assert_eq!(after_query(since), "after:2025/03/07");
    }

    #[test]
    fn outgoing_mail_builds_rfc822() {
        let mail = OutgoingMail {
            from: "me@example.com".to_string(),
            to: vec!["you@example.com".to_string()],
            cc: vec![],
            subject: "Re: Invoice".to_string(),
            body_text: "Paid today.".to_string(),
            thread_id: Some("t1".to_string()),
        };
        let bytes = build_rfc822(&mail).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Subject: Re: Invoice"));
        assert!(text.contains("To: you@example.com"));
        assert!(text.contains("Paid today."));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let mail = OutgoingMail {
            from: "me@example.com".to_string(),
            to: vec!["not an address".to_string()],
            cc: vec![],
            subject: "x".to_string(),
            body_text: "y".to_string(),
            thread_id: None,
        };
        assert!(build_rfc822(&mail).is_err());
    }
}
