//! Idempotent message ingestion from connected mailboxes.
//!
//! A message already stored under `(provider, provider_message_id)` is never
//! fetched or written again. One failing message is counted and logged; the
//! rest of the batch still runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ListQuery, MailAccount, MailProvider, MailProviderFactory, NormalizedMessage, ProviderKind};
use crate::config::SyncConfig;
use crate::error::MailError;
use crate::store::{NewMessage, NewThread, Store, SyncLogEntry, SyncLogStatus};

const BODY_TRUNCATION_MARKER: &str = "\n\n...[truncated]";

/// Counters for one account sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub threads_created: u32,
    pub emails_created: u32,
    /// Stored messages are immutable, so this stays zero.
    pub emails_updated: u32,
    /// Already ingested.
    pub emails_skipped: u32,
    pub errors: u32,
}

impl SyncStats {
    fn absorb(&mut self, other: &SyncStats) {
        self.threads_created += other.threads_created;
        self.emails_created += other.emails_created;
        self.emails_updated += other.emails_updated;
        self.emails_skipped += other.emails_skipped;
        self.errors += other.errors;
    }
}

/// Result of syncing every selected account of one user.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserSyncReport {
    pub user_id: String,
    pub providers: BTreeMap<ProviderKind, SyncStats>,
    pub total_emails: u32,
    pub total_threads: u32,
    /// One entry per account whose sync failed outright.
    pub errors: Vec<String>,
}

enum Ingested {
    Created { thread_created: bool },
    Skipped,
}

pub struct MailSync {
    store: Arc<dyn Store>,
    providers: Arc<dyn MailProviderFactory>,
    config: SyncConfig,
}

impl MailSync {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<dyn MailProviderFactory>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            providers,
            config,
        }
    }

    pub fn providers(&self) -> &Arc<dyn MailProviderFactory> {
        &self.providers
    }

    /// Sync every connected account of `user_id`, or only the one for `provider`.
    ///
    /// A full sync lists without a date filter; otherwise only messages
    /// newer than the lookback window are listed.
    pub async fn sync_user(
        &self,
        user_id: &str,
        provider: Option<ProviderKind>,
        lookback_days: Option<u32>,
        full_sync: bool,
    ) -> Result<UserSyncReport, MailError> {
        let accounts: Vec<MailAccount> = self
            .store
            .list_accounts(user_id)
            .await?
            .into_iter()
            .filter(|a| provider.is_none_or(|p| a.provider == p))
            .collect();
        if accounts.is_empty() {
            return Err(MailError::NotConnected {
                user_id: user_id.to_string(),
                provider: provider.map_or_else(|| "mail".to_string(), |p| p.to_string()),
            });
        }

        let mut report = UserSyncReport {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        for account in &accounts {
            match self.sync_account(account, lookback_days, full_sync).await {
                Ok(stats) => {
                    report.total_emails += stats.emails_created;
                    report.total_threads += stats.threads_created;
                    report
                        .providers
                        .entry(account.provider)
                        .or_default()
                        .absorb(&stats);
                }
                Err(e) => {
                    warn!(user_id, provider = %account.provider, error = %e, "Account sync failed");
                    report.errors.push(format!("{}: {e}", account.provider));
                }
            }
        }
        Ok(report)
    }

    /// Sync one account and record a sync log for the run.
    pub async fn sync_account(
        &self,
        account: &MailAccount,
        lookback_days: Option<u32>,
        full_sync: bool,
    ) -> Result<SyncStats, MailError> {
        let clock = Instant::now();
        let lookback = lookback_days.unwrap_or(self.config.default_lookback_days);
        let query = ListQuery {
            since: (!full_sync).then(|| Utc::now() - Duration::days(i64::from(lookback))),
            max_results: self.config.max_messages,
        };

        let outcome = match self.providers.client_for(account) {
            Ok(client) => self.ingest_listing(client.as_ref(), account, &query).await,
            Err(e) => Err(e),
        };

        let (status, message) = match &outcome {
            Ok(stats) if stats.errors > 0 => (
                SyncLogStatus::Partial,
                format!("Synced {} emails, {} errors", stats.emails_created, stats.errors),
            ),
            Ok(stats) => (
                SyncLogStatus::Success,
                format!("Synced {} emails", stats.emails_created),
            ),
            Err(e) => (SyncLogStatus::Failed, e.to_string()),
        };
        let entry = SyncLogEntry {
            user_id: account.user_id.clone(),
            provider: account.provider,
            status,
            run_time_ms: clock.elapsed().as_millis() as i64,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_sync_log(&entry).await {
            warn!(user_id = %account.user_id, error = %e, "Failed to record sync log");
        }

        if let Ok(stats) = &outcome {
            info!(
                user_id = %account.user_id,
                provider = %account.provider,
                threads_created = stats.threads_created,
                emails_created = stats.emails_created,
                emails_skipped = stats.emails_skipped,
                errors = stats.errors,
                run_time_ms = entry.run_time_ms,
                "Account sync completed"
            );
        }
        outcome
    }

    async fn ingest_listing(
        &self,
        client: &dyn MailProvider,
        account: &MailAccount,
        query: &ListQuery,
    ) -> Result<SyncStats, MailError> {
        let ids = client.list_message_ids(query).await?;
        info!(
            user_id = %account.user_id,
            provider = %account.provider,
            count = ids.len(),
            "Syncing messages"
        );

        let mut stats = SyncStats::default();
        for id in &ids {
            self.ingest_counted(client, account, id, &mut stats).await;
        }
        Ok(stats)
    }

    /// Ingest one message, folding the outcome into `stats`.
    async fn ingest_counted(
        &self,
        client: &dyn MailProvider,
        account: &MailAccount,
        message_id: &str,
        stats: &mut SyncStats,
    ) {
        match self.ingest_message(client, account, message_id).await {
            Ok(Ingested::Created { thread_created }) => {
                stats.emails_created += 1;
                if thread_created {
                    stats.threads_created += 1;
                }
            }
            Ok(Ingested::Skipped) => stats.emails_skipped += 1,
            Err(e) => {
                warn!(
                    provider = %account.provider,
                    message_id,
                    error = %e,
                    "Failed to sync message"
                );
                stats.errors += 1;
            }
        }
    }

    async fn ingest_message(
        &self,
        client: &dyn MailProvider,
        account: &MailAccount,
        message_id: &str,
    ) -> Result<Ingested, MailError> {
        if self.store.message_exists(account.provider, message_id).await? {
            debug!(message_id, "Message already ingested");
            return Ok(Ingested::Skipped);
        }
        let message = client.get_message(message_id).await?;
        self.store_message(account, message).await
    }

    async fn store_message(
        &self,
        account: &MailAccount,
        message: NormalizedMessage,
    ) -> Result<Ingested, MailError> {
        let sent_at = message.date.unwrap_or_else(Utc::now);
        let upsert = self
            .store
            .upsert_thread(&NewThread {
                user_id: account.user_id.clone(),
                provider: account.provider,
                provider_thread_id: message.provider_thread_id.clone(),
                subject: message.subject.clone(),
                last_message_at: sent_at,
            })
            .await?;

        let inserted = self
            .store
            .insert_message(&NewMessage {
                thread_id: upsert.thread.id,
                provider: account.provider,
                provider_message_id: message.provider_message_id,
                subject: message.subject,
                from_address: message.from,
                to_addresses: message.to,
                cc_addresses: message.cc,
                sent_at,
                internet_message_id: message.internet_message_id,
                body_text: truncate_body(&message.body_text, self.config.max_body_chars),
            })
            .await?;

        Ok(if inserted {
            Ingested::Created {
                thread_created: upsert.created,
            }
        } else {
            Ingested::Skipped
        })
    }

    /// Ingest every message of one provider thread.
    ///
    /// Returns the provider's canonical id for the thread, or `None` when the
    /// provider does not know it.
    pub async fn sync_thread(
        &self,
        account: &MailAccount,
        thread_id: &str,
    ) -> Result<Option<String>, MailError> {
        let client = self.providers.client_for(account)?;
        let Some(listing) = client.thread_message_ids(thread_id).await? else {
            debug!(thread_id, provider = %account.provider, "Provider does not know thread");
            return Ok(None);
        };

        let mut stats = SyncStats::default();
        for id in &listing.message_ids {
            self.ingest_counted(client.as_ref(), account, id, &mut stats).await;
        }
        info!(
            thread_id,
            canonical_id = %listing.canonical_id,
            emails_created = stats.emails_created,
            errors = stats.errors,
            "Thread synced"
        );
        Ok(Some(listing.canonical_id))
    }

    /// Latest sync log per provider.
    pub async fn sync_status(&self, user_id: &str) -> Result<Vec<SyncLogEntry>, MailError> {
        Ok(self.store.latest_sync_logs(user_id).await?)
    }
}

fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let cut: String = body.chars().take(max_chars).collect();
    format!("{cut}{BODY_TRUNCATION_MARKER}")
}
