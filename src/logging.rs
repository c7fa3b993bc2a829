//! Log setup and id formatting.
//!
//! Log lines are emitted with `tracing` macros throughout the crate. [`init`]
//! installs a `tracing-subscriber` formatter writing to stderr, with ANSI
//! colour only when stderr is a terminal.
//!
//! Ids in log fields are shortened with [`short_id`] so that a line stays
//! readable while still being greppable:
//!
//! ```text
//! 2026-02-11T21:33:12.000Z  INFO spoke_relay::delivery: live delivery acknowledged device=alice/phone message_id=m-5f1c2ab
//! ```

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::protocol::{DeviceIdentity, MessageId};

pub const DEFAULT_FILTER: &str = "info";

const LOG_ID_TRUNCATE_LEN: usize = 7;

/// Install the global subscriber. Returns `false` when one is already set
/// (tests, embedding applications).
pub fn init(filter: &str) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// `user/device` with both halves shortened.
pub fn device(device: &DeviceIdentity) -> String {
    format!(
        "{}/{}",
        short_id(device.user().as_str()),
        short_id(device.device())
    )
}

/// `m-` prefixed, shortened message id.
pub fn msg_id(id: &MessageId) -> String {
    format!("m-{}", short_id(id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_keep_the_prefix() {
        assert_eq!(short_id("abcdefghijk"), "abcdefg");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("ééééééééé"), "ééééééé");
    }

    #[test]
    fn device_labels_shorten_both_halves() {
        let device_id = DeviceIdentity::new("alice-with-a-long-name", "phone");
        assert_eq!(device(&device_id), "alice-w/phone");
    }

    #[test]
    fn message_ids_are_prefixed() {
        let id = MessageId::from("5f1c2ab9e0d4".to_string());
        assert_eq!(msg_id(&id), "m-5f1c2ab");
    }
}
