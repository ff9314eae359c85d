//! Resolve an externally supplied thread id to a stored thread.
//!
//! Three steps, each falling through to the next on a miss or error:
//! internal UUID, exact provider thread id, then the provider's canonical id
//! for an aliased thread.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::MailProviderFactory;
use crate::error::MailError;
use crate::store::{Store, ThreadRecord};

/// Which step found the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    InternalId,
    ProviderId,
    Canonical,
}

#[derive(Debug, Clone)]
pub struct ResolvedThread {
    pub thread: ThreadRecord,
    pub via: Resolution,
}

pub struct ThreadResolver {
    store: Arc<dyn Store>,
    providers: Arc<dyn MailProviderFactory>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>, providers: Arc<dyn MailProviderFactory>) -> Self {
        Self { store, providers }
    }

    /// `Ok(None)` only after all three steps missed.
    pub async fn resolve(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<ResolvedThread>, MailError> {
        let external_id = external_id.trim();

        if let Ok(id) = Uuid::parse_str(external_id) {
            match self.store.get_thread(id).await {
                Ok(Some(thread)) if thread.user_id == user_id => {
                    return Ok(Some(ResolvedThread {
                        thread,
                        via: Resolution::InternalId,
                    }));
                }
                Ok(_) => {}
                Err(e) => warn!(external_id, error = %e, "Internal id lookup failed"),
            }
        }

        match self.store.find_thread(user_id, None, external_id).await {
            Ok(Some(thread)) => {
                return Ok(Some(ResolvedThread {
                    thread,
                    via: Resolution::ProviderId,
                }));
            }
            Ok(None) => {}
            Err(e) => warn!(external_id, error = %e, "Provider id lookup failed"),
        }

        for account in self.store.list_accounts(user_id).await? {
            let canonical = match self.providers.client_for(&account) {
                Ok(client) => client.canonical_thread_id(external_id).await,
                Err(e) => Err(e),
            };
            let canonical = match canonical {
                Ok(Some(canonical)) => canonical,
                Ok(None) => continue,
                Err(e) => {
                    warn!(external_id, provider = %account.provider, error = %e, "Canonicalization failed");
                    continue;
                }
            };
            debug!(external_id, canonical = %canonical, provider = %account.provider, "Canonicalized thread id");
            if let Some(thread) = self
                .store
                .find_thread(user_id, Some(account.provider), &canonical)
                .await?
            {
                return Ok(Some(ResolvedThread {
                    thread,
                    via: Resolution::Canonical,
                }));
            }
        }

        debug!(user_id, external_id, "Thread not resolved");
        Ok(None)
    }
}
