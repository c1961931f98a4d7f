//! # sdkctl-host — SDK controller client
//!
//! Connects to a device's SDK controller service, claims one service
//! through the handshake and then exchanges messages and queries with
//! it. The session engine runs on a single thread inside a
//! [`tokio::task::LocalSet`]; the client drives it from the same task.

pub mod client;
pub mod config;
