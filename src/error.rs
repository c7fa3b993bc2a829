//! Delivery error taxonomy.
//!
//! Only [`DeliveryError`] and [`FanoutError`] reach callers. Live delivery
//! failures are internal: every one of them sends the message down the
//! fallback path, and push failures are logged where they happen.

use thiserror::Error;

use crate::acks::AckError;
use crate::connection::ConnectionError;
use crate::fanout::RecipientOutcome;
use crate::protocol::{DeviceIdentity, FrameError};
use crate::storage::StoreError;

/// Why a live send did not end in an acknowledgement.
#[derive(Debug, Error)]
pub enum LiveDeliveryError {
    #[error("no live connection")]
    ConnectionAbsent,
    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),
    #[error(transparent)]
    Ack(#[from] AckError),
    #[error("could not encode frame: {0}")]
    Encode(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("store unavailable for {device}: {source}")]
    StoreUnavailable {
        device: DeviceIdentity,
        #[source]
        source: StoreError,
    },
}

impl DeliveryError {
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            DeliveryError::StoreUnavailable { device, .. } => device,
        }
    }

    pub fn store_unavailable(device: &DeviceIdentity, source: StoreError) -> Self {
        DeliveryError::StoreUnavailable {
            device: device.clone(),
            source,
        }
    }
}

/// One recipient of a fan-out that did not reach a terminal outcome.
#[derive(Debug)]
pub struct RecipientFailure {
    pub device: DeviceIdentity,
    pub error: DeliveryError,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    /// Some recipients failed. `delivered` holds the outcomes of the rest.
    #[error("delivery failed for {} recipients", .failed.len())]
    Partial {
        delivered: Vec<RecipientOutcome>,
        failed: Vec<RecipientFailure>,
    },
}
