use std::{
    collections::BTreeMap,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::TransportMessage,
    outbox::{MarkDispatched, StagedMessage, StageMessages, StreamPending},
};

/// Volatile outbox backend for testing or single-process use.
///
/// Row ids come from a shared counter, so streaming the `BTreeMap` in key
/// order reproduces staging order. Marking a row dispatched removes it; a row
/// another caller already removed is skipped silently.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    next_id: Arc<AtomicI64>,
    messages: Arc<Mutex<BTreeMap<i64, TransportMessage>>>,
}

impl InMemoryOutbox {
    /// Number of rows still pending.
    pub async fn pending_count(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl StageMessages for InMemoryOutbox {
    type Error = Infallible;
    type ID = i64;
    type Transaction<'a> = ();

    async fn stage_messages(
        &self,
        envelopes: Vec<TransportMessage>,
        _tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        let mut messages = self.messages.lock().await;
        for envelope in envelopes {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            messages.insert(id, envelope);
        }
        Ok(())
    }
}

#[async_trait]
impl MarkDispatched for InMemoryOutbox {
    type Error = Infallible;
    type ID = i64;

    async fn mark_dispatched(
        &self,
        messages: Vec<StagedMessage<Self::ID>>,
    ) -> Result<(), Self::Error> {
        let mut pending = self.messages.lock().await;
        for message in messages {
            pending.remove(&message.id);
        }
        Ok(())
    }
}

#[async_trait]
impl StreamPending for InMemoryOutbox {
    type Error = Infallible;
    type ID = i64;

    /// Stream a snapshot of the pending rows in staging order.
    async fn pending(
        &self,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<StagedMessage<Self::ID>, Self::Error>>, Self::Error> {
        let messages = self.messages.lock().await;
        let snapshot: Vec<_> = messages
            .iter()
            .map(|(id, envelope)| {
                Ok(StagedMessage {
                    id: *id,
                    envelope: envelope.clone(),
                })
            })
            .collect();
        Ok(Box::pin(tokio_stream::iter(snapshot)))
    }
}
