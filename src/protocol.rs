//! Relay data model and wire envelope.
//!
//! ## Summary
//! - A `DeviceIdentity` (`user`, `device`) is the addressing unit for every
//!   delivery. A user may own several devices, each reachable on its own.
//! - Message bodies are opaque ciphertext. The relay only knows which of the
//!   three shapes a body has (`Payload`) so it can split multi-recipient
//!   messages and label frames.
//! - `PendingMessage` is the unit the delivery engine moves around and the
//!   document persisted to the offline queue.
//! - `Frame` is the record sent over a live connection. Inbound frames of type
//!   `ack` carry only the correlation id of the frame they acknowledge.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a single client installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    user: UserId,
    device: String,
}

impl DeviceIdentity {
    pub fn new(user: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            user: UserId::new(user),
            device: device.into(),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.device)
    }
}

/// Server-assigned identifier of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pairs an outbound live frame with the `ack` frame that answers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque bytes, carried as standard base64 in JSON.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Blob(Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for Blob {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Key-wrapping entry addressed to one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey {
    pub user: UserId,
    pub device: String,
    pub key: Blob,
}

impl RecipientKey {
    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            user: self.user.clone(),
            device: self.device.clone(),
        }
    }
}

/// One ciphertext container shared by many recipients, each with its own
/// wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecipientMessage {
    pub container: Blob,
    pub keys: Vec<RecipientKey>,
}

impl MultiRecipientMessage {
    /// Split into one fragment per key entry. Every fragment carries the full
    /// container and exactly one key.
    pub fn split(&self) -> Vec<(DeviceIdentity, MultiRecipientMessage)> {
        self.keys
            .iter()
            .map(|key| {
                (
                    key.device_identity(),
                    MultiRecipientMessage {
                        container: self.container.clone(),
                        keys: vec![key.clone()],
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptState {
    Received,
    Displayed,
}

/// Delivery receipt returned to the sender of an acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The sender's own id for the acknowledged message.
    pub message_id: String,
    pub state: ReceiptState,
    /// Device that sent the original message.
    pub sender: DeviceIdentity,
    /// Device that received it.
    pub recipient: DeviceIdentity,
    pub received_at: u64,
}

/// Body of a pending message. Exactly one shape per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Single(Blob),
    MultiRecipientFragment(MultiRecipientMessage),
    Receipt(Receipt),
}

impl Payload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Payload::Single(_) => FrameType::Message,
            Payload::MultiRecipientFragment(_) => FrameType::MultiRecipientMessage,
            Payload::Receipt(_) => FrameType::Receipt,
        }
    }
}

/// What kind of wake-up a sender asks for when the recipient is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushType {
    None,
    Call,
    #[default]
    Message,
    ContactRequest,
    CancelCall,
}

/// A message accepted for delivery to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: MessageId,
    pub client_message_id: String,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    pub sender: DeviceIdentity,
    pub recipient: DeviceIdentity,
    pub payload: Payload,
    pub requests_ack: bool,
    pub push_type: PushType,
}

impl PendingMessage {
    pub fn new(
        client_message_id: impl Into<String>,
        sender: DeviceIdentity,
        recipient: DeviceIdentity,
        payload: Payload,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            client_message_id: client_message_id.into(),
            created_at: now_millis(),
            sender,
            recipient,
            payload,
            requests_ack: true,
            push_type: PushType::default(),
        }
    }

    pub fn with_push_type(mut self, push_type: PushType) -> Self {
        self.push_type = push_type;
        self
    }

    pub fn with_requests_ack(mut self, requests_ack: bool) -> Self {
        self.requests_ack = requests_ack;
        self
    }

    /// The receipt owed to the sender once the recipient acknowledged this
    /// message, if the sender asked for one. Receipts never ask for receipts.
    pub fn receipt(&self, received_at: u64) -> Option<PendingMessage> {
        if !self.requests_ack || matches!(self.payload, Payload::Receipt(_)) {
            return None;
        }
        let receipt = Receipt {
            message_id: self.client_message_id.clone(),
            state: ReceiptState::Received,
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            received_at,
        };
        Some(
            PendingMessage::new(
                self.client_message_id.clone(),
                self.recipient.clone(),
                self.sender.clone(),
                Payload::Receipt(receipt),
            )
            .with_push_type(PushType::None)
            .with_requests_ack(false),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    RecipientBlocked,
}

/// Terminal result of delivering one message to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    LiveDelivered,
    QueuedForOfflineDelivery,
    /// Queued, and a push notification was accepted by the provider.
    PushNotified,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Message,
    MultiRecipientMessage,
    Receipt,
    Ack,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Message as seen by the receiving client inside a `message` or
/// `multi_recipient_message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub message_id: String,
    pub sender: DeviceIdentity,
    pub recipient: DeviceIdentity,
    pub created_at: u64,
    pub payload: Payload,
}

impl From<&PendingMessage> for RelayedMessage {
    fn from(message: &PendingMessage) -> Self {
        Self {
            message_id: message.client_message_id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            created_at: message.created_at,
            payload: message.payload.clone(),
        }
    }
}

/// Binary record exchanged over a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: CorrelationId,
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Blob>,
}

impl Frame {
    pub fn ack(id: CorrelationId) -> Self {
        Self {
            id,
            kind: FrameType::Ack,
            body: None,
        }
    }

    /// Frame carrying `message` to its recipient. Receipts travel as the bare
    /// receipt record, everything else as a `RelayedMessage`.
    pub fn for_message(id: CorrelationId, message: &PendingMessage) -> Result<Self, FrameError> {
        let body = match &message.payload {
            Payload::Receipt(receipt) => serde_json::to_vec(receipt)?,
            _ => serde_json::to_vec(&RelayedMessage::from(message))?,
        };
        Ok(Self {
            id,
            kind: message.payload.frame_type(),
            body: Some(Blob::from(body)),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
