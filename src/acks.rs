//! Acknowledgement tracking for live deliveries.
//!
//! Every live send registers a waiter under a correlation id before the frame
//! goes out. Exactly one of three things ends a waiter: the matching `ack`
//! frame, the deadline, or loss of the connection it was sent on. Whichever
//! comes first removes the waiter from the table; the others find nothing and
//! do nothing, so a late ack for an expired id is inert.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::logging;
use crate::protocol::{CorrelationId, DeviceIdentity};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("acknowledgement timed out")]
    Timeout,
    #[error("connection lost before acknowledgement")]
    ConnectionLost,
    #[error("correlation id {0} is already awaiting an acknowledgement")]
    DuplicateCorrelationId(CorrelationId),
}

struct Waiter {
    device: DeviceIdentity,
    connection: Option<ConnectionId>,
    generation: u64,
    completion: oneshot::Sender<Result<(), AckError>>,
}

#[derive(Default)]
pub struct AckTracker {
    next_id: AtomicU64,
    next_generation: AtomicU64,
    waiters: Mutex<HashMap<CorrelationId, Waiter>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<CorrelationId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A correlation id not handed out before by this tracker.
    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a waiter for `id`. Call this before the frame is sent so an
    /// immediate ack cannot be missed. Dropping the returned handle without
    /// waiting withdraws the waiter.
    pub fn expect(
        &self,
        id: CorrelationId,
        device: &DeviceIdentity,
        connection: Option<ConnectionId>,
    ) -> Result<AckWaiter<'_>, AckError> {
        let (completion, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        match self.waiters().entry(id) {
            Entry::Occupied(_) => return Err(AckError::DuplicateCorrelationId(id)),
            Entry::Vacant(entry) => {
                entry.insert(Waiter {
                    device: device.clone(),
                    connection,
                    generation,
                    completion,
                });
            }
        }
        Ok(AckWaiter {
            tracker: self,
            id,
            generation,
            rx,
        })
    }

    /// Register and wait in one step.
    pub async fn await_ack(
        &self,
        id: CorrelationId,
        device: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<(), AckError> {
        self.expect(id, device, None)?.wait(timeout).await
    }

    /// Resolve the waiter for `id` if it belongs to `device`. Unknown,
    /// expired, already resolved and foreign ids are ignored.
    pub fn acknowledge(&self, id: CorrelationId, device: &DeviceIdentity) -> bool {
        let waiter = {
            let mut waiters = self.waiters();
            match waiters.get(&id) {
                Some(waiter) if &waiter.device == device => waiters.remove(&id),
                Some(waiter) => {
                    warn!(
                        correlation_id = %id,
                        device = %logging::device(device),
                        expected = %logging::device(&waiter.device),
                        "ignoring ack from a device the frame was not sent to"
                    );
                    None
                }
                None => {
                    debug!(correlation_id = %id, device = %logging::device(device), "ignoring ack for unknown correlation id");
                    None
                }
            }
        };
        match waiter {
            Some(waiter) => waiter.completion.send(Ok(())).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter bound to `connection`. Returns how many were failed.
    pub fn connection_lost(&self, connection: ConnectionId) -> usize {
        let lost: Vec<Waiter> = {
            let mut waiters = self.waiters();
            let ids: Vec<CorrelationId> = waiters
                .iter()
                .filter(|(_, waiter)| waiter.connection == Some(connection))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| waiters.remove(id)).collect()
        };
        let count = lost.len();
        for waiter in lost {
            let _ = waiter.completion.send(Err(AckError::ConnectionLost));
        }
        if count > 0 {
            debug!(connection = %connection, count, "failed pending acks for closed connection");
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.waiters().len()
    }

    fn withdraw(&self, id: CorrelationId, generation: u64) -> bool {
        let mut waiters = self.waiters();
        match waiters.get(&id) {
            Some(waiter) if waiter.generation == generation => {
                waiters.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// A registered waiter. Resolve it with [`AckWaiter::wait`].
pub struct AckWaiter<'a> {
    tracker: &'a AckTracker,
    id: CorrelationId,
    generation: u64,
    rx: oneshot::Receiver<Result<(), AckError>>,
}

impl AckWaiter<'_> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// First of ack, connection loss and `timeout` wins.
    pub async fn wait(self, timeout: Duration) -> Result<(), AckError> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Like [`AckWaiter::wait`], against a deadline shared with earlier steps
    /// of the same delivery attempt.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<(), AckError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AckError::ConnectionLost),
            Err(_) => {
                if self.tracker.withdraw(self.id, self.generation) {
                    debug!(correlation_id = %self.id, "ack deadline passed");
                    return Err(AckError::Timeout);
                }
                // The ack took the waiter between the deadline and withdrawal.
                self.rx.try_recv().unwrap_or(Err(AckError::Timeout))
            }
        }
    }
}

impl Drop for AckWaiter<'_> {
    fn drop(&mut self) {
        self.tracker.withdraw(self.id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    fn laptop() -> DeviceIdentity {
        DeviceIdentity::new("bob", "laptop")
    }

    #[tokio::test]
    async fn matching_ack_resolves_the_waiter() {
        let tracker = AckTracker::new();
        let id = tracker.next_correlation_id();
        let waiter = tracker.expect(id, &laptop(), None).unwrap();

        assert!(tracker.acknowledge(id, &laptop()));
        assert_eq!(waiter.wait(LONG).await, Ok(()));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn timeout_fails_and_late_ack_is_inert() {
        let tracker = AckTracker::new();
        let id = tracker.next_correlation_id();

        assert_eq!(
            tracker.await_ack(id, &laptop(), SHORT).await,
            Err(AckError::Timeout)
        );
        assert!(!tracker.acknowledge(id, &laptop()));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn ack_from_another_device_is_ignored() {
        let tracker = AckTracker::new();
        let id = tracker.next_correlation_id();
        let waiter = tracker.expect(id, &laptop(), None).unwrap();

        assert!(!tracker.acknowledge(id, &DeviceIdentity::new("mallory", "laptop")));
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(waiter.wait(SHORT).await, Err(AckError::Timeout));
    }

    #[tokio::test]
    async fn unknown_and_repeated_acks_are_no_ops() {
        let tracker = AckTracker::new();
        assert!(!tracker.acknowledge(CorrelationId::new(999), &laptop()));

        let id = tracker.next_correlation_id();
        let waiter = tracker.expect(id, &laptop(), None).unwrap();
        assert!(tracker.acknowledge(id, &laptop()));
        assert!(!tracker.acknowledge(id, &laptop()));
        assert_eq!(waiter.wait(LONG).await, Ok(()));
    }

    #[tokio::test]
    async fn outstanding_ids_cannot_be_reused() {
        let tracker = AckTracker::new();
        let id = CorrelationId::new(5);
        let _waiter = tracker.expect(id, &laptop(), None).unwrap();
        assert!(matches!(
            tracker.expect(id, &laptop(), None),
            Err(AckError::DuplicateCorrelationId(dup)) if dup == id
        ));
    }

    #[tokio::test]
    async fn resolved_ids_can_be_reused() {
        let tracker = AckTracker::new();
        let id = CorrelationId::new(5);
        let first = tracker.expect(id, &laptop(), None).unwrap();
        tracker.acknowledge(id, &laptop());
        assert_eq!(first.wait(LONG).await, Ok(()));

        let second = tracker.expect(id, &laptop(), None).unwrap();
        assert!(tracker.acknowledge(id, &laptop()));
        assert_eq!(second.wait(LONG).await, Ok(()));
    }

    #[tokio::test]
    async fn connection_loss_fails_only_its_waiters() {
        let tracker = AckTracker::new();
        let (lost, _lost_rx) = Connection::channel();
        let (alive, _alive_rx) = Connection::channel();

        let a = tracker.next_correlation_id();
        let b = tracker.next_correlation_id();
        let on_lost = tracker.expect(a, &laptop(), Some(lost.id())).unwrap();
        let on_alive = tracker.expect(b, &laptop(), Some(alive.id())).unwrap();

        assert_eq!(tracker.connection_lost(lost.id()), 1);
        assert_eq!(on_lost.wait(LONG).await, Err(AckError::ConnectionLost));
        assert_eq!(tracker.outstanding(), 1);

        tracker.acknowledge(b, &laptop());
        assert_eq!(on_alive.wait(LONG).await, Ok(()));
    }

    #[tokio::test]
    async fn passed_deadline_times_out_at_once() {
        let tracker = AckTracker::new();
        let id = tracker.next_correlation_id();
        let waiter = tracker.expect(id, &laptop(), None).unwrap();

        let started = Instant::now();
        assert_eq!(
            waiter.wait_until(started).await,
            Err(AckError::Timeout)
        );
        assert!(started.elapsed() < SHORT);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropping_a_waiter_withdraws_it() {
        let tracker = AckTracker::new();
        let id = tracker.next_correlation_id();
        drop(tracker.expect(id, &laptop(), None).unwrap());
        assert_eq!(tracker.outstanding(), 0);
        assert!(!tracker.acknowledge(id, &laptop()));
    }
}
