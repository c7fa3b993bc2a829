//! Push notification boundary.
//!
//! The relay builds a provider-neutral notification and hands the encoded
//! bytes to a [`PushProvider`] together with the device token. Provider
//! failures are reported to the caller, which only logs them.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::logging;
use crate::protocol::{Blob, DeviceIdentity, Payload, PendingMessage, PushType};

pub const TITLE_NEW_MESSAGE: &str = "New Message";
pub const TITLE_CONTACT_REQUEST: &str = "Contact Request";
pub const ALERT_BODY: &str = "Open the app to view";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push rejected by provider: {0}")]
    Rejected(String),
    #[error("push provider unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn submit(&self, token: &str, payload: Vec<u8>) -> Result<(), PushError>;
}

/// Message copy embedded in a notification so the client can show it
/// without connecting first.
#[derive(Debug, Clone, Serialize)]
struct InlineContent<'a> {
    sender: &'a DeviceIdentity,
    payload: &'a Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNotification {
    pub push_type: PushType,
    pub title: String,
    pub body: String,
    /// Notifications are grouped per sending user.
    pub thread_id: String,
    pub badge: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Blob>,
}

impl PushNotification {
    /// The notification owed for `message`, or `None` when its push type
    /// asks for no wake-up or is not supported.
    pub fn for_message(
        message: &PendingMessage,
        inline_limit: usize,
    ) -> Result<Option<Self>, PushError> {
        let alert = |title: &str| PushNotification {
            push_type: message.push_type,
            title: title.to_string(),
            body: ALERT_BODY.to_string(),
            thread_id: message.sender.user().to_string(),
            badge: 1,
            content: None,
        };

        match message.push_type {
            PushType::None => Ok(None),
            PushType::Call | PushType::CancelCall => {
                info!(
                    push_type = ?message.push_type,
                    message_id = %logging::msg_id(&message.id),
                    "call notifications are not supported"
                );
                Ok(None)
            }
            PushType::ContactRequest => Ok(Some(alert(TITLE_CONTACT_REQUEST))),
            PushType::Message => {
                let inline = serde_json::to_vec(&InlineContent {
                    sender: &message.sender,
                    payload: &message.payload,
                })?;
                let mut notification = alert(TITLE_NEW_MESSAGE);
                if inline.len() <= inline_limit {
                    notification.content = Some(Blob::from(inline));
                } else {
                    info!(
                        size = inline.len(),
                        message_id = %logging::msg_id(&message.id),
                        "message too large to embed in notification"
                    );
                }
                Ok(Some(notification))
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PushError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Provider that only logs what it would have sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushProvider;

#[async_trait]
impl PushProvider for LogPushProvider {
    async fn submit(&self, token: &str, payload: Vec<u8>) -> Result<(), PushError> {
        info!(
            token = %logging::short_id(token),
            bytes = payload.len(),
            "push notification submitted"
        );
        Ok(())
    }
}
