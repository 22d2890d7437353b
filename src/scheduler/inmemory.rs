use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::scheduler::{ScheduledMessage, ScheduledStore, SchedulerError};

/// Volatile scheduled-message backing for testing or single-process use.
///
/// `mark_dispatched` is a remove under one mutex acquisition, which makes it
/// the atomic conditional operation the dispatcher race requires.
#[derive(Clone, Default)]
pub struct InMemoryScheduledStore {
    messages: Arc<Mutex<HashMap<Uuid, ScheduledMessage>>>,
}

#[async_trait::async_trait]
impl ScheduledStore for InMemoryScheduledStore {
    async fn add(&self, message: ScheduledMessage) -> Result<(), SchedulerError> {
        self.messages.lock().await.insert(message.token, message);
        Ok(())
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<ScheduledMessage>, SchedulerError> {
        let messages = self.messages.lock().await;
        let mut due: Vec<_> = messages
            .values()
            .filter(|m| m.scheduled_time <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then(a.token.cmp(&b.token))
        });
        due.truncate(batch_size);
        Ok(due)
    }

    async fn mark_dispatched(&self, token: Uuid) -> Result<bool, SchedulerError> {
        Ok(self.messages.lock().await.remove(&token).is_some())
    }
}
