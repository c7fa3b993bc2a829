//! Fan-out of multi-recipient messages.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::delivery::DeliveryOrchestrator;
use crate::error::{FanoutError, RecipientFailure};
use crate::logging;
use crate::protocol::{
    DeliveryOutcome, DeviceIdentity, MultiRecipientMessage, Payload, PendingMessage, PushType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientOutcome {
    pub device: DeviceIdentity,
    pub outcome: DeliveryOutcome,
}

/// A multi-recipient message as accepted from its sender.
#[derive(Debug, Clone)]
pub struct MultiRecipientSend {
    pub client_message_id: String,
    pub sender: DeviceIdentity,
    pub message: MultiRecipientMessage,
    pub push_type: PushType,
    pub requests_ack: bool,
}

#[derive(Clone)]
pub struct FanoutCoordinator {
    orchestrator: Arc<DeliveryOrchestrator>,
}

impl FanoutCoordinator {
    pub fn new(orchestrator: Arc<DeliveryOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Deliver one fragment per key entry, all concurrently. Every fragment
    /// runs to a terminal outcome regardless of how its siblings fare.
    pub async fn send(&self, send: MultiRecipientSend) -> Result<Vec<RecipientOutcome>, FanoutError> {
        let fragments = send.message.split();
        debug!(
            sender = %logging::device(&send.sender),
            recipients = fragments.len(),
            "fanning out message"
        );

        let deliveries = fragments.into_iter().map(|(device, fragment)| {
            let message = PendingMessage::new(
                send.client_message_id.clone(),
                send.sender.clone(),
                device.clone(),
                Payload::MultiRecipientFragment(fragment),
            )
            .with_push_type(send.push_type)
            .with_requests_ack(send.requests_ack);
            let orchestrator = Arc::clone(&self.orchestrator);
            async move { (device, orchestrator.deliver(message).await) }
        });

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (device, result) in join_all(deliveries).await {
            match result {
                Ok(outcome) => delivered.push(RecipientOutcome { device, outcome }),
                Err(error) => failed.push(RecipientFailure { device, error }),
            }
        }

        if failed.is_empty() {
            return Ok(delivered);
        }
        for failure in &failed {
            warn!(
                sender = %logging::device(&send.sender),
                device = %logging::device(&failure.device),
                error = %failure.error,
                "fan-out delivery failed"
            );
        }
        Err(FanoutError::Partial { delivered, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::protocol::{Blob, RecipientKey, UserId};
    use crate::push::LogPushProvider;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn every_key_gets_its_own_delivery() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            RelayConfig::default(),
            store.clone(),
            store.clone(),
            Arc::new(LogPushProvider),
        ));
        let fanout = FanoutCoordinator::new(orchestrator);

        let keys = ["laptop", "phone", "tablet"]
            .iter()
            .map(|device| RecipientKey {
                user: UserId::new("bob"),
                device: device.to_string(),
                key: Blob::from(device.as_bytes()),
            })
            .collect();
        let outcomes = fanout
            .send(MultiRecipientSend {
                client_message_id: "group-1".into(),
                sender: DeviceIdentity::new("alice", "phone"),
                message: MultiRecipientMessage {
                    container: Blob::from(&b"shared"[..]),
                    keys,
                },
                push_type: PushType::Message,
                requests_ack: true,
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| o.outcome == DeliveryOutcome::QueuedForOfflineDelivery));
        assert_eq!(store.len().await, 3);
    }
}
