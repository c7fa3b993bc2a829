//! Delivery orchestrator.
//!
//! Per recipient device a delivery either reaches a live connection and is
//! acknowledged, or falls back: blocked senders are dropped, everything else
//! is persisted and, when nobody else can wake the user, announced by push.
//!
//! All deliveries to one device, including queue drains, run under that
//! device's lock so a fresh live send cannot overtake replayed messages.
//! Receipts are delivered after the lock is released; a receipt travels the
//! other way and would otherwise wait on the sender's lock while holding the
//! recipient's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acks::{AckError, AckTracker};
use crate::config::{RelayConfig, ReplayPolicy};
use crate::connection::Connection;
use crate::error::{DeliveryError, LiveDeliveryError};
use crate::logging;
use crate::protocol::{
    now_millis, CorrelationId, DeliveryOutcome, DeviceIdentity, DropReason, Frame, PendingMessage,
};
use crate::push::{PushError, PushNotification, PushProvider};
use crate::queue::OfflineQueue;
use crate::registry::ConnectionRegistry;
use crate::storage::{MessageStore, UserDirectory};

/// Idle lock entries are pruned once the table grows past this.
const DEVICE_LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
struct DeviceLocks {
    locks: Mutex<HashMap<DeviceIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    async fn lock(&self, device: &DeviceIdentity) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > DEVICE_LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(device.clone()).or_default())
        };
        lock.lock_owned().await
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Result of replaying one device's offline queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Replayed and removed from the queue.
    pub delivered: usize,
    /// Left queued because they were not addressed to the draining device.
    pub skipped: usize,
    /// The drain stopped early; the failed message and everything after it
    /// stay queued.
    pub interrupted: bool,
}

pub struct DeliveryOrchestrator {
    config: RelayConfig,
    registry: ConnectionRegistry,
    acks: AckTracker,
    queue: OfflineQueue,
    directory: Arc<dyn UserDirectory>,
    push: Arc<dyn PushProvider>,
    device_locks: DeviceLocks,
}

impl DeliveryOrchestrator {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        push: Arc<dyn PushProvider>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.registry_shards),
            acks: AckTracker::new(),
            queue: OfflineQueue::new(store),
            directory,
            push,
            device_locks: DeviceLocks::default(),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    pub async fn register_connection(&self, device: DeviceIdentity, connection: Connection) {
        self.registry.register(device, connection).await;
    }

    /// Drop `connection` for `device` and fail the acks still waiting on it.
    pub async fn disconnect(&self, device: &DeviceIdentity, connection: &Connection) -> bool {
        let removed = self.registry.remove(device, connection).await;
        self.acks.connection_lost(connection.id());
        removed
    }

    /// Route an inbound `ack` frame from `device`.
    pub fn acknowledge(&self, id: CorrelationId, device: &DeviceIdentity) -> bool {
        self.acks.acknowledge(id, device)
    }

    /// Deliver `message` to its recipient device. Errors only when the
    /// message could be neither delivered live nor persisted.
    pub async fn deliver(&self, message: PendingMessage) -> Result<DeliveryOutcome, DeliveryError> {
        let (outcome, receipt) = {
            let _guard = self.device_locks.lock(&message.recipient).await;
            self.deliver_locked(&message).await?
        };
        if let Some(receipt) = receipt {
            self.send_receipt(receipt).await;
        }
        Ok(outcome)
    }

    /// Replay everything queued for `device` in creation order.
    pub async fn drain(&self, device: &DeviceIdentity) -> Result<DrainReport, DeliveryError> {
        let mut report = DrainReport::default();
        let mut receipts = Vec::new();
        let result = {
            let _guard = self.device_locks.lock(device).await;
            self.drain_locked(device, &mut report, &mut receipts).await
        };
        for receipt in receipts {
            self.send_receipt(receipt).await;
        }
        info!(
            device = %logging::device(device),
            delivered = report.delivered,
            skipped = report.skipped,
            interrupted = report.interrupted,
            "queue drain finished"
        );
        result.map(|()| report)
    }

    async fn drain_locked(
        &self,
        device: &DeviceIdentity,
        report: &mut DrainReport,
        receipts: &mut Vec<PendingMessage>,
    ) -> Result<(), DeliveryError> {
        let await_ack = self.config.replay_policy == ReplayPolicy::AwaitAck;
        let mut queued = self.queue.drain_ordered(device);
        debug!(device = %logging::device(device), "draining offline queue");

        while let Some(next) = queued.next().await {
            let message = next.map_err(|e| DeliveryError::store_unavailable(device, e))?;
            if &message.recipient != device {
                warn!(
                    device = %logging::device(device),
                    addressed_to = %logging::device(&message.recipient),
                    message_id = %logging::msg_id(&message.id),
                    "skipping queued message addressed to another device"
                );
                report.skipped += 1;
                continue;
            }

            let Some(connection) = self.registry.lookup(device).await else {
                debug!(device = %logging::device(device), "device went offline during drain");
                report.interrupted = true;
                break;
            };

            if let Err(e) = self.send_over(&connection, &message, await_ack).await {
                info!(
                    device = %logging::device(device),
                    message_id = %logging::msg_id(&message.id),
                    error = %e,
                    "replay failed, keeping remaining messages queued"
                );
                report.interrupted = true;
                break;
            }

            self.queue
                .delete(&message.id)
                .await
                .map_err(|e| DeliveryError::store_unavailable(device, e))?;
            report.delivered += 1;
            if await_ack {
                receipts.extend(message.receipt(now_millis()));
            }
        }
        Ok(())
    }

    async fn deliver_locked(
        &self,
        message: &PendingMessage,
    ) -> Result<(DeliveryOutcome, Option<PendingMessage>), DeliveryError> {
        match self.send_live(message).await {
            Ok(()) => {
                info!(
                    device = %logging::device(&message.recipient),
                    message_id = %logging::msg_id(&message.id),
                    "live delivery acknowledged"
                );
                Ok((DeliveryOutcome::LiveDelivered, message.receipt(now_millis())))
            }
            Err(e) => {
                if !matches!(e, LiveDeliveryError::ConnectionAbsent) {
                    info!(
                        device = %logging::device(&message.recipient),
                        message_id = %logging::msg_id(&message.id),
                        error = %e,
                        "live delivery failed"
                    );
                }
                Ok((self.fallback(message).await?, None))
            }
        }
    }

    async fn send_live(&self, message: &PendingMessage) -> Result<(), LiveDeliveryError> {
        let connection = self
            .registry
            .lookup(&message.recipient)
            .await
            .ok_or(LiveDeliveryError::ConnectionAbsent)?;
        self.send_over(&connection, message, true).await
    }

    /// Send `message` over `connection` under a fresh correlation id and,
    /// when `await_ack` is set, wait for the device to acknowledge it. The
    /// send and the wait share one `ack_timeout` deadline.
    async fn send_over(
        &self,
        connection: &Connection,
        message: &PendingMessage,
        await_ack: bool,
    ) -> Result<(), LiveDeliveryError> {
        let deadline = Instant::now() + self.config.ack_timeout;
        let id = self.acks.next_correlation_id();
        let frame = Frame::for_message(id, message)?.encode()?;
        let waiter = if await_ack {
            Some(
                self.acks
                    .expect(id, &message.recipient, Some(connection.id()))?,
            )
        } else {
            None
        };

        tokio::time::timeout_at(deadline, connection.send(frame))
            .await
            .map_err(|_| AckError::Timeout)??;
        debug!(
            device = %logging::device(&message.recipient),
            message_id = %logging::msg_id(&message.id),
            correlation_id = %id,
            "frame sent"
        );

        if let Some(waiter) = waiter {
            waiter.wait_until(deadline).await?;
        }
        Ok(())
    }

    async fn fallback(&self, message: &PendingMessage) -> Result<DeliveryOutcome, DeliveryError> {
        let recipient = &message.recipient;
        let blocked = self
            .directory
            .is_blocked(recipient.user(), message.sender.user())
            .await
            .map_err(|e| DeliveryError::store_unavailable(recipient, e))?;
        if blocked {
            info!(
                device = %logging::device(recipient),
                sender = %logging::device(&message.sender),
                message_id = %logging::msg_id(&message.id),
                "recipient blocked sender, dropping message"
            );
            return Ok(DeliveryOutcome::Dropped(DropReason::RecipientBlocked));
        }

        self.queue
            .enqueue(message)
            .await
            .map_err(|e| DeliveryError::store_unavailable(recipient, e))?;

        if self.registry.has_other_device(recipient).await {
            debug!(device = %logging::device(recipient), "user reachable on another device, no push");
            return Ok(DeliveryOutcome::QueuedForOfflineDelivery);
        }
        if recipient.user() == message.sender.user() {
            return Ok(DeliveryOutcome::QueuedForOfflineDelivery);
        }

        let token = match self.directory.push_token(recipient).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(device = %logging::device(recipient), "no push token on file");
                return Ok(DeliveryOutcome::QueuedForOfflineDelivery);
            }
            Err(e) => {
                warn!(device = %logging::device(recipient), error = %e, "push token lookup failed");
                return Ok(DeliveryOutcome::QueuedForOfflineDelivery);
            }
        };

        match self.push_message(&token, message).await {
            Ok(true) => {
                info!(
                    device = %logging::device(recipient),
                    message_id = %logging::msg_id(&message.id),
                    "push notification submitted"
                );
                Ok(DeliveryOutcome::PushNotified)
            }
            Ok(false) => Ok(DeliveryOutcome::QueuedForOfflineDelivery),
            Err(e) => {
                warn!(
                    device = %logging::device(recipient),
                    message_id = %logging::msg_id(&message.id),
                    error = %e,
                    "push submission failed"
                );
                Ok(DeliveryOutcome::QueuedForOfflineDelivery)
            }
        }
    }

    /// Returns `false` when the message's push type sends nothing.
    async fn push_message(&self, token: &str, message: &PendingMessage) -> Result<bool, PushError> {
        let Some(notification) =
            PushNotification::for_message(message, self.config.push_inline_limit)?
        else {
            return Ok(false);
        };
        self.push.submit(token, notification.encode()?).await?;
        Ok(true)
    }

    async fn send_receipt(&self, receipt: PendingMessage) {
        let _guard = self.device_locks.lock(&receipt.recipient).await;
        match self.deliver_locked(&receipt).await {
            Ok((outcome, _)) => debug!(
                device = %logging::device(&receipt.recipient),
                outcome = ?outcome,
                "receipt delivered"
            ),
            Err(e) => warn!(
                device = %logging::device(&receipt.recipient),
                error = %e,
                "failed to deliver receipt"
            ),
        }
    }

    pub fn tracked_device_locks(&self) -> usize {
        self.device_locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn device_locks_serialize_one_device_only() {
        let locks = DeviceLocks::default();
        let laptop = DeviceIdentity::new("bob", "laptop");
        let phone = DeviceIdentity::new("bob", "phone");

        let held = locks.lock(&laptop).await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(&phone)).await;
        assert!(other.is_ok());
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock(&laptop)).await;
        assert!(same.is_err());

        drop(held);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(&laptop))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn idle_device_locks_are_pruned() {
        let locks = DeviceLocks::default();
        for i in 0..=DEVICE_LOCK_PRUNE_THRESHOLD {
            drop(locks.lock(&DeviceIdentity::new("user", format!("d{i}"))).await);
        }
        assert_eq!(locks.len(), DEVICE_LOCK_PRUNE_THRESHOLD + 1);
        let _held = locks.lock(&DeviceIdentity::new("user", "fresh")).await;
        assert_eq!(locks.len(), 1);
    }
}
