//! The SDK controller protocol on top of `AsyncSocket`.

mod dispatcher;
pub mod handshake;
pub mod packet;
pub mod port;
pub mod query;
pub mod socket;

pub use handshake::HANDSHAKE_TIMEOUT;
pub use packet::{DirectPacketCallback, SdkCtlDirectPacket, SdkCtlMessage, SdkCtlPacket};
pub use port::PortStatus;
pub use query::{QueryCallback, SdkCtlQuery};
pub use socket::{DEFAULT_PORT, SdkCtlHandler, SdkCtlSocket, SocketState};
