pub mod acks;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod storage;
