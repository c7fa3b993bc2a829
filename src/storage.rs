//! Durable store boundary.
//!
//! The delivery core only needs three document operations on pending messages
//! (insert, find-by-recipient ordered by creation time, delete-by-id) plus a
//! small per-user directory for block lists and push tokens. Both live behind
//! traits so the core never sees a concrete backend. Attachment documents
//! uploaded by clients sit in a third, independent [`BlobStore`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{DeviceIdentity, MessageId, Payload, PendingMessage, PushType, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_one(&self, message: &PendingMessage) -> Result<(), StoreError>;

    /// Every message addressed to `recipient`, oldest first. Messages with the
    /// same creation time come back in insertion order.
    async fn find_for_recipient(
        &self,
        recipient: &DeviceIdentity,
    ) -> Result<Vec<PendingMessage>, StoreError>;

    /// Returns whether a message was removed.
    async fn delete_by_id(&self, id: &MessageId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether `recipient` has blocked `sender`.
    async fn is_blocked(&self, recipient: &UserId, sender: &UserId) -> Result<bool, StoreError>;

    async fn block(&self, user: &UserId, blocked: &UserId) -> Result<(), StoreError>;

    /// Returns whether `blocked` was on the list.
    async fn unblock(&self, user: &UserId, blocked: &UserId) -> Result<bool, StoreError>;

    async fn push_token(&self, device: &DeviceIdentity) -> Result<Option<String>, StoreError>;

    async fn set_push_token(&self, device: &DeviceIdentity, token: &str)
        -> Result<(), StoreError>;
}

/// Attachment document uploaded by a user and fetched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBlob {
    /// Upper-case hex; lookups are case-insensitive.
    pub id: String,
    pub creator: UserId,
    pub document: Value,
}

impl StoredBlob {
    pub fn new(creator: UserId, document: Value) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            id: hex::encode_upper(bytes),
            creator,
            document,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn insert_blob(&self, blob: &StoredBlob) -> Result<(), StoreError>;

    async fn find_blob(&self, id: &str) -> Result<Option<StoredBlob>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    messages: Vec<PendingMessage>,
    blocked: HashMap<UserId, HashSet<UserId>>,
    tokens: HashMap<DeviceIdentity, String>,
    blobs: HashMap<String, StoredBlob>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: tokio::sync::Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_one(&self, message: &PendingMessage) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        state.messages.push(message.clone());
        Ok(())
    }

    async fn find_for_recipient(
        &self,
        recipient: &DeviceIdentity,
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<PendingMessage> = state
            .messages
            .iter()
            .filter(|m| &m.recipient == recipient)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        found.sort_by_key(|m| m.created_at);
        Ok(found)
    }

    async fn delete_by_id(&self, id: &MessageId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.messages.len();
        state.messages.retain(|m| &m.id != id);
        Ok(state.messages.len() != before)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn is_blocked(&self, recipient: &UserId, sender: &UserId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .blocked
            .get(recipient)
            .is_some_and(|list| list.contains(sender)))
    }

    async fn block(&self, user: &UserId, blocked: &UserId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .blocked
            .entry(user.clone())
            .or_default()
            .insert(blocked.clone());
        Ok(())
    }

    async fn unblock(&self, user: &UserId, blocked: &UserId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .blocked
            .get_mut(user)
            .is_some_and(|list| list.remove(blocked)))
    }

    async fn push_token(&self, device: &DeviceIdentity) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.tokens.get(device).cloned())
    }

    async fn set_push_token(
        &self,
        device: &DeviceIdentity,
        token: &str,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .tokens
            .insert(device.clone(), token.to_string());
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn insert_blob(&self, blob: &StoredBlob) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .blobs
            .insert(blob.id.to_uppercase(), blob.clone());
        Ok(())
    }

    async fn find_blob(&self, id: &str) -> Result<Option<StoredBlob>, StoreError> {
        Ok(self.state.lock().await.blobs.get(&id.to_uppercase()).cloned())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed store. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

struct MessageRow {
    id: String,
    client_message_id: String,
    created_at: i64,
    sender_user: String,
    sender_device: String,
    recipient_user: String,
    recipient_device: String,
    payload: String,
    requests_ack: bool,
    push_type: String,
}

impl MessageRow {
    fn into_message(self) -> Result<PendingMessage, StoreError> {
        let payload: Payload = serde_json::from_str(&self.payload)?;
        let push_type: PushType = serde_json::from_str(&self.push_type)?;
        Ok(PendingMessage {
            id: MessageId::from(self.id),
            client_message_id: self.client_message_id,
            created_at: self.created_at as u64,
            sender: DeviceIdentity::new(self.sender_user, self.sender_device),
            recipient: DeviceIdentity::new(self.recipient_user, self.recipient_device),
            payload,
            requests_ack: self.requests_ack,
            push_type,
        })
    }
}

impl SqliteStore {
    /// Open or create a database at `path`. Creates the schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?
    }
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pending_messages (
            id                TEXT PRIMARY KEY,
            client_message_id TEXT NOT NULL,
            created_at        INTEGER NOT NULL,
            sender_user       TEXT NOT NULL,
            sender_device     TEXT NOT NULL,
            recipient_user    TEXT NOT NULL,
            recipient_device  TEXT NOT NULL,
            payload           TEXT NOT NULL,
            requests_ack      INTEGER NOT NULL,
            push_type         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_recipient
            ON pending_messages(recipient_user, recipient_device, created_at);

        CREATE TABLE IF NOT EXISTS blocked_users (
            user_id         TEXT NOT NULL,
            blocked_user_id TEXT NOT NULL,
            PRIMARY KEY (user_id, blocked_user_id)
        );

        CREATE TABLE IF NOT EXISTS device_tokens (
            user_id   TEXT NOT NULL,
            device_id TEXT NOT NULL,
            token     TEXT NOT NULL,
            PRIMARY KEY (user_id, device_id)
        );

        CREATE TABLE IF NOT EXISTS blobs (
            id       TEXT PRIMARY KEY,
            creator  TEXT NOT NULL,
            document TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_one(&self, message: &PendingMessage) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&message.payload)?;
        let push_type = serde_json::to_string(&message.push_type)?;
        let message = message.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pending_messages
                 (id, client_message_id, created_at, sender_user, sender_device,
                  recipient_user, recipient_device, payload, requests_ack, push_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id.as_str(),
                    message.client_message_id,
                    message.created_at as i64,
                    message.sender.user().as_str(),
                    message.sender.device(),
                    message.recipient.user().as_str(),
                    message.recipient.device(),
                    payload,
                    message.requests_ack,
                    push_type,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_for_recipient(
        &self,
        recipient: &DeviceIdentity,
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let recipient = recipient.clone();
        let rows = self
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, client_message_id, created_at, sender_user, sender_device,
                            recipient_user, recipient_device, payload, requests_ack, push_type
                     FROM pending_messages
                     WHERE recipient_user = ?1 AND recipient_device = ?2
                     ORDER BY created_at ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(
                    params![recipient.user().as_str(), recipient.device()],
                    |row| {
                        Ok(MessageRow {
                            id: row.get(0)?,
                            client_message_id: row.get(1)?,
                            created_at: row.get(2)?,
                            sender_user: row.get(3)?,
                            sender_device: row.get(4)?,
                            recipient_user: row.get(5)?,
                            recipient_device: row.get(6)?,
                            payload: row.get(7)?,
                            requests_ack: row.get(8)?,
                            push_type: row.get(9)?,
                        })
                    },
                )?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok(result)
            })
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn delete_by_id(&self, id: &MessageId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.call(move |conn| {
            let affected = conn.execute(
                "DELETE FROM pending_messages WHERE id = ?1",
                params![id.as_str()],
            )?;
            Ok(affected > 0)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn is_blocked(&self, recipient: &UserId, sender: &UserId) -> Result<bool, StoreError> {
        let (recipient, sender) = (recipient.clone(), sender.clone());
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM blocked_users WHERE user_id = ?1 AND blocked_user_id = ?2",
                params![recipient.as_str(), sender.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn block(&self, user: &UserId, blocked: &UserId) -> Result<(), StoreError> {
        let (user, blocked) = (user.clone(), blocked.clone());
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blocked_users (user_id, blocked_user_id) VALUES (?1, ?2)",
                params![user.as_str(), blocked.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn unblock(&self, user: &UserId, blocked: &UserId) -> Result<bool, StoreError> {
        let (user, blocked) = (user.clone(), blocked.clone());
        self.call(move |conn| {
            let affected = conn.execute(
                "DELETE FROM blocked_users WHERE user_id = ?1 AND blocked_user_id = ?2",
                params![user.as_str(), blocked.as_str()],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn push_token(&self, device: &DeviceIdentity) -> Result<Option<String>, StoreError> {
        let device = device.clone();
        self.call(move |conn| {
            let token = conn
                .query_row(
                    "SELECT token FROM device_tokens WHERE user_id = ?1 AND device_id = ?2",
                    params![device.user().as_str(), device.device()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token)
        })
        .await
    }

    async fn set_push_token(
        &self,
        device: &DeviceIdentity,
        token: &str,
    ) -> Result<(), StoreError> {
        let device = device.clone();
        let token = token.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO device_tokens (user_id, device_id, token) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, device_id) DO UPDATE SET token = excluded.token",
                params![device.user().as_str(), device.device(), token],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn insert_blob(&self, blob: &StoredBlob) -> Result<(), StoreError> {
        let document = serde_json::to_string(&blob.document)?;
        let id = blob.id.to_uppercase();
        let creator = blob.creator.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (id, creator, document) VALUES (?1, ?2, ?3)",
                params![id, creator.as_str(), document],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_blob(&self, id: &str) -> Result<Option<StoredBlob>, StoreError> {
        let id = id.to_uppercase();
        let row = self
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, creator, document FROM blobs WHERE id = ?1",
                        params![id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(|(id, creator, document)| -> Result<StoredBlob, StoreError> {
            Ok(StoredBlob {
                id,
                creator: UserId::new(creator),
                document: serde_json::from_str(&document)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Blob;

    fn bob_laptop() -> DeviceIdentity {
        DeviceIdentity::new("bob", "laptop")
    }

    fn message_at(created_at: u64, body: &[u8]) -> PendingMessage {
        let mut message = PendingMessage::new(
            format!("client-{created_at}"),
            DeviceIdentity::new("alice", "phone"),
            bob_laptop(),
            Payload::Single(Blob::from(body)),
        );
        message.created_at = created_at;
        message
    }

    async fn check_ordering_and_delete(store: &dyn MessageStore) {
        let late = message_at(300, b"late");
        let early = message_at(100, b"early");
        let tie_first = message_at(200, b"tie-1");
        let tie_second = message_at(200, b"tie-2");
        let mut elsewhere = message_at(50, b"other");
        elsewhere.recipient = DeviceIdentity::new("bob", "phone");

        for message in [&late, &early, &tie_first, &tie_second, &elsewhere] {
            store.insert_one(message).await.unwrap();
        }

        let found = store.find_for_recipient(&bob_laptop()).await.unwrap();
        let ids: Vec<&MessageId> = found.iter().map(|m| &m.id).collect();
        assert_eq!(ids, vec![&early.id, &tie_first.id, &tie_second.id, &late.id]);
        assert_eq!(found[0], early);

        assert!(store.delete_by_id(&early.id).await.unwrap());
        assert!(!store.delete_by_id(&early.id).await.unwrap());
        assert_eq!(store.find_for_recipient(&bob_laptop()).await.unwrap().len(), 3);
    }

    async fn check_directory(directory: &dyn UserDirectory) {
        let bob = UserId::new("bob");
        let alice = UserId::new("alice");

        assert!(!directory.is_blocked(&bob, &alice).await.unwrap());
        directory.block(&bob, &alice).await.unwrap();
        directory.block(&bob, &alice).await.unwrap();
        assert!(directory.is_blocked(&bob, &alice).await.unwrap());
        assert!(!directory.is_blocked(&alice, &bob).await.unwrap());
        assert!(directory.unblock(&bob, &alice).await.unwrap());
        assert!(!directory.unblock(&bob, &alice).await.unwrap());

        assert_eq!(directory.push_token(&bob_laptop()).await.unwrap(), None);
        directory.set_push_token(&bob_laptop(), "tok1").await.unwrap();
        directory.set_push_token(&bob_laptop(), "tok2").await.unwrap();
        assert_eq!(
            directory.push_token(&bob_laptop()).await.unwrap().as_deref(),
            Some("tok2")
        );
    }

    async fn check_blobs(blobs: &dyn BlobStore) {
        let blob = StoredBlob::new(
            UserId::new("alice"),
            serde_json::json!({ "name": "photo.jpg", "chunks": [1, 2, 3] }),
        );
        assert_eq!(blob.id, blob.id.to_uppercase());
        assert_eq!(blob.id.len(), 32);

        blobs.insert_blob(&blob).await.unwrap();
        assert_eq!(
            blobs.find_blob(&blob.id.to_lowercase()).await.unwrap(),
            Some(blob.clone())
        );
        assert_eq!(blobs.find_blob("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blobs_are_found_by_case_insensitive_id() {
        check_blobs(&MemoryStore::new()).await;
        check_blobs(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn memory_store_orders_by_creation_time() {
        check_ordering_and_delete(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn memory_directory_round_trip() {
        check_directory(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_orders_by_creation_time() {
        check_ordering_and_delete(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_directory_round_trip() {
        check_directory(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_one_copy() {
        let store = MemoryStore::new();
        let message = message_at(1, b"x");
        store.insert_one(&message).await.unwrap();
        store.insert_one(&message).await.unwrap();
        assert_eq!(store.len().await, 1);

        let sqlite = SqliteStore::open_in_memory().unwrap();
        sqlite.insert_one(&message).await.unwrap();
        sqlite.insert_one(&message).await.unwrap();
        assert_eq!(sqlite.find_for_recipient(&bob_laptop()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let message = message_at(7, b"persisted").with_push_type(PushType::ContactRequest);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_one(&message).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let found = store.find_for_recipient(&bob_laptop()).await.unwrap();
        assert_eq!(found, vec![message]);
    }
}
