//! Connection registry: at most one live connection per device.
//!
//! The table is split into shards keyed by a hash of the device identity.
//! Register and remove for one device always land on the same shard and run
//! under its write lock, so a connection racing in observes and evicts the one
//! installed before it instead of clobbering it independently.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::logging;
use crate::protocol::{DeviceIdentity, UserId};

pub const DEFAULT_SHARDS: usize = 16;

type Shard = RwLock<HashMap<DeviceIdentity, Connection>>;

pub struct ConnectionRegistry {
    shards: Box<[Shard]>,
}

impl ConnectionRegistry {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, device: &DeviceIdentity) -> &Shard {
        let mut hasher = DefaultHasher::new();
        device.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Install `connection` for `device`, closing whatever was there before.
    pub async fn register(&self, device: DeviceIdentity, connection: Connection) {
        let label = logging::device(&device);
        let connection_id = connection.id();
        let previous = {
            let mut shard = self.shard(&device).write().await;
            shard.insert(device, connection)
        };

        match previous {
            Some(previous) if previous.id() != connection_id => {
                info!(
                    device = %label,
                    evicted = %previous.id(),
                    connection = %connection_id,
                    "replacing existing connection"
                );
                previous.close();
            }
            _ => info!(device = %label, connection = %connection_id, "connection registered"),
        }
    }

    pub async fn lookup(&self, device: &DeviceIdentity) -> Option<Connection> {
        self.shard(device).read().await.get(device).cloned()
    }

    /// Whether any device of `user` is connected.
    pub async fn has_connection(&self, user: &UserId) -> bool {
        for shard in self.shards.iter() {
            if shard.read().await.keys().any(|device| device.user() == user) {
                return true;
            }
        }
        false
    }

    /// Whether a device of the same user other than `device` is connected.
    pub async fn has_other_device(&self, device: &DeviceIdentity) -> bool {
        for shard in self.shards.iter() {
            let shard = shard.read().await;
            if shard
                .keys()
                .any(|other| other.user() == device.user() && other != device)
            {
                return true;
            }
        }
        false
    }

    /// Remove `device` only while `connection` is still the registered one,
    /// so a late close handler cannot evict its replacement.
    pub async fn remove(&self, device: &DeviceIdentity, connection: &Connection) -> bool {
        let mut shard = self.shard(device).write().await;
        match shard.get(device) {
            Some(current) if current.id() == connection.id() => {
                shard.remove(device);
                debug!(device = %logging::device(device), connection = %connection.id(), "connection removed");
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;

    fn laptop() -> DeviceIdentity {
        DeviceIdentity::new("bob", "laptop")
    }

    #[tokio::test]
    async fn lookup_misses_unknown_devices() {
        let registry = ConnectionRegistry::default();
        assert!(registry.lookup(&laptop()).await.is_none());
        assert!(!registry.has_connection(&UserId::new("bob")).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn reconnect_closes_and_replaces_the_old_connection() {
        let registry = ConnectionRegistry::default();
        let (first, mut first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();

        registry.register(laptop(), first.clone()).await;
        registry.register(laptop(), second.clone()).await;

        assert_eq!(first_rx.recv().await, Outbound::Close);
        let current = registry.lookup(&laptop()).await.expect("registered");
        assert_eq!(current.id(), second.id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_remove_keeps_the_newer_connection() {
        let registry = ConnectionRegistry::default();
        let (first, _first_rx) = Connection::channel();
        let (second, _second_rx) = Connection::channel();

        registry.register(laptop(), first.clone()).await;
        registry.register(laptop(), second.clone()).await;

        assert!(!registry.remove(&laptop(), &first).await);
        assert_eq!(registry.lookup(&laptop()).await.unwrap().id(), second.id());

        assert!(registry.remove(&laptop(), &second).await);
        assert!(!registry.remove(&laptop(), &second).await);
        assert!(registry.lookup(&laptop()).await.is_none());
    }

    #[tokio::test]
    async fn user_presence_spans_devices() {
        let registry = ConnectionRegistry::new(4);
        let (phone, _rx) = Connection::channel();
        registry
            .register(DeviceIdentity::new("bob", "phone"), phone)
            .await;

        assert!(registry.has_connection(&UserId::new("bob")).await);
        assert!(!registry.has_connection(&UserId::new("alice")).await);
        assert!(registry.has_other_device(&laptop()).await);
        assert!(
            !registry
                .has_other_device(&DeviceIdentity::new("bob", "phone"))
                .await
        );
    }

    #[tokio::test]
    async fn concurrent_registrations_leave_one_connection() {
        let registry = std::sync::Arc::new(ConnectionRegistry::default());
        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (connection, rx) = Connection::channel();
            receivers.push((connection.id(), rx));
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(laptop(), connection).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let survivor = registry.lookup(&laptop()).await.unwrap().id();
        for (id, mut rx) in receivers {
            if id != survivor {
                assert_eq!(rx.recv().await, Outbound::Close);
            }
        }
        assert_eq!(registry.len().await, 1);
    }
}
