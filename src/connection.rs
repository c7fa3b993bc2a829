//! Handles for live client connections.
//!
//! A [`Connection`] is the sending half the delivery engine holds; the
//! transport task owns the matching [`ConnectionReceiver`] and moves its
//! output onto the socket. Closing is a signal, never an await, so evicting a
//! connection cannot block the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

pub const OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    frames: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
}

impl Connection {
    pub fn channel() -> (Connection, ConnectionReceiver) {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Connection, ConnectionReceiver) {
        let (frames, rx) = mpsc::channel(capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        (
            Connection {
                id,
                frames,
                shutdown: Arc::clone(&shutdown),
            },
            ConnectionReceiver { rx, shutdown },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Ask the transport to close. Returns immediately.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Transport end of a [`Connection`].
#[derive(Debug)]
pub struct ConnectionReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<Notify>,
}

impl ConnectionReceiver {
    /// Next thing to do with the socket. A close request wins over queued
    /// frames; once every sender is gone this keeps returning `Close`.
    pub async fn recv(&mut self) -> Outbound {
        tokio::select! {
            biased;
            _ = self.shutdown.notified() => Outbound::Close,
            frame = self.rx.recv() => match frame {
                Some(frame) => Outbound::Frame(frame),
                None => Outbound::Close,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (connection, mut receiver) = Connection::channel();
        connection.send(vec![1]).await.unwrap();
        connection.send(vec![2]).await.unwrap();
        assert_eq!(receiver.recv().await, Outbound::Frame(vec![1]));
        assert_eq!(receiver.recv().await, Outbound::Frame(vec![2]));
    }

    #[tokio::test]
    async fn close_does_not_wait_for_the_transport() {
        let (connection, mut receiver) = Connection::with_capacity(1);
        connection.send(vec![1]).await.unwrap();
        connection.close();
        assert_eq!(receiver.recv().await, Outbound::Close);
    }

    #[tokio::test]
    async fn send_fails_once_transport_is_gone() {
        let (connection, receiver) = Connection::channel();
        drop(receiver);
        assert!(connection.is_closed());
        assert_eq!(connection.send(vec![1]).await, Err(ConnectionError::Closed));
    }

    #[test]
    fn every_connection_gets_its_own_id() {
        let (a, _ra) = Connection::channel();
        let (b, _rb) = Connection::channel();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
