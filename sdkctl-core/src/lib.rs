//! # sdkctl-core
//!
//! Asynchronous socket engine and wire protocol for talking to an SDK
//! controller service over TCP.
//!
//! This crate contains:
//! - **Engine**: `AsyncSocketConnector`, `AsyncSocket` and `AsyncSocketIo`,
//!   callback-driven and running on a tokio `LocalSet`
//! - **Runtime facade**: `Timer`, `IoWatch` and deadline helpers
//! - **Protocol**: `SdkCtlSocket` with handshake, messages, queries,
//!   direct packets and the reply dispatcher
//! - **Wire**: packet headers and `SdkCtlCodec` for framed peers
//! - **Recycler**: per-session pool of protocol buffers
//! - **Error**: `SdkCtlError`, a `thiserror`-based error type

pub mod asio;
pub mod codec;
pub mod connector;
pub mod error;
pub mod header;
pub mod looper;
pub mod recycler;
pub mod sdkctl;
pub mod socket;
pub mod socket_io;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use asio::{AsyncIoAction, AsyncIoState};
pub use codec::{Frame, SdkCtlCodec};
pub use connector::AsyncSocketConnector;
pub use error::SdkCtlError;
pub use header::{
    ByteOrder, MAX_PACKET_SIZE, MessageHeader, PacketHeader, PacketType, QueryHeader,
    QueryReplyHeader, SIGNATURE, init_message_header,
};
pub use looper::{IoEvents, IoWatch, Timer};
pub use recycler::Recycler;
pub use sdkctl::{
    DEFAULT_PORT, PortStatus, SdkCtlDirectPacket, SdkCtlHandler, SdkCtlMessage, SdkCtlQuery,
    SdkCtlSocket, SocketState,
};
pub use socket::AsyncSocket;
pub use socket_io::{AsyncSocketIo, IoBuffer, IoDirection};
