//! Offline queue: the narrow adapter between the delivery engine and the
//! message store. No delivery policy lives here.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::logging;
use crate::protocol::{DeviceIdentity, MessageId, PendingMessage};
use crate::storage::{MessageStore, StoreError};

#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn MessageStore>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, message: &PendingMessage) -> Result<(), StoreError> {
        self.store.insert_one(message).await?;
        debug!(
            device = %logging::device(&message.recipient),
            message_id = %logging::msg_id(&message.id),
            "message queued"
        );
        Ok(())
    }

    /// Messages queued for `device`, oldest first.
    ///
    /// The store is not queried until the stream is first polled, and the
    /// stream covers what was queued at that moment. It cannot be restarted;
    /// call again for a fresh view.
    pub fn drain_ordered(
        &self,
        device: &DeviceIdentity,
    ) -> BoxStream<'static, Result<PendingMessage, StoreError>> {
        let store = Arc::clone(&self.store);
        let device = device.clone();
        stream::once(async move { store.find_for_recipient(&device).await })
            .flat_map(|found| {
                let items: Vec<Result<PendingMessage, StoreError>> = match found {
                    Ok(messages) => messages.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    pub async fn delete(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.store.delete_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Blob, Payload};
    use crate::storage::MemoryStore;

    fn queued(created_at: u64) -> PendingMessage {
        let mut message = PendingMessage::new(
            format!("c{created_at}"),
            DeviceIdentity::new("alice", "phone"),
            DeviceIdentity::new("bob", "laptop"),
            Payload::Single(Blob::default()),
        );
        message.created_at = created_at;
        message
    }

    #[tokio::test]
    async fn drain_is_lazy_and_ordered() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()));
        let device = DeviceIdentity::new("bob", "laptop");

        let drain = queue.drain_ordered(&device);
        queue.enqueue(&queued(20)).await.unwrap();
        queue.enqueue(&queued(10)).await.unwrap();

        let drained: Vec<u64> = drain
            .map(|m| m.unwrap().created_at)
            .collect()
            .await;
        assert_eq!(drained, vec![10, 20]);
    }

    #[tokio::test]
    async fn each_drain_requeries() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()));
        let device = DeviceIdentity::new("bob", "laptop");
        let first = queued(1);
        queue.enqueue(&first).await.unwrap();

        assert_eq!(queue.drain_ordered(&device).count().await, 1);
        assert!(queue.delete(&first.id).await.unwrap());
        assert_eq!(queue.drain_ordered(&device).count().await, 0);
    }
}
