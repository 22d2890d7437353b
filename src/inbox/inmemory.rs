use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::inbox::{InboxError, InboxState, InboxStore};

/// Volatile inbox backing for testing or single-process deployments.
///
/// The compare-and-insert runs under one mutex acquisition, so concurrent
/// `try_add` calls for the same key admit exactly one caller.
#[derive(Clone, Default)]
pub struct InMemoryInbox {
    rows: Arc<Mutex<HashMap<(Uuid, String), InboxState>>>,
}

#[async_trait::async_trait]
impl InboxStore for InMemoryInbox {
    async fn try_add(&self, state: InboxState) -> Result<bool, InboxError> {
        let mut rows = self.rows.lock().await;
        let key = (state.message_id, state.consumer.clone());
        match rows.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(state);
                Ok(true)
            }
        }
    }

    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<(), InboxError> {
        let mut rows = self.rows.lock().await;
        if let Some(state) = rows.get_mut(&(message_id, consumer.to_owned())) {
            state.processed_time = Some(processed_time);
        }
        Ok(())
    }

    async fn get(
        &self,
        message_id: Uuid,
        consumer: &str,
    ) -> Result<Option<InboxState>, InboxError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&(message_id, consumer.to_owned())).cloned())
    }
}
