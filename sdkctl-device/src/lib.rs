//! # sdkctl-device — mock SDK controller service
//!
//! Accepts host connections the way the device-side SDK controller does:
//! takes the byte-order flag, answers the handshake query, enables the
//! port, then echoes messages and answers queries with their own
//! payload.
//!
//! Only one host at a time may hold a given service.

pub mod config;
pub mod service;
