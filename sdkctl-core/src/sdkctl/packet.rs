//! Outgoing and received packets.
//!
//! `SdkCtlPacket` owns one recycled block holding a complete packet (or,
//! for received ones, the part after the generic header). Direct packets
//! send a caller-owned `Bytes` as is.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::error::SdkCtlError;
use crate::header::{ByteOrder, PacketHeader, PacketType};
use crate::socket::AsyncSocket;
use crate::socket_io::{AsyncSocketIo, IoBuffer};

use super::socket::{SdkCtlInner, SdkCtlSocket};

// ── SdkCtlPacket ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct SdkCtlPacket {
    inner: Rc<PacketInner>,
}

struct PacketInner {
    sdkctl: Weak<SdkCtlInner>,
    packet_type: PacketType,
    /// Empty while a write owns it.
    buffer: RefCell<BytesMut>,
    /// Where the payload starts in `buffer`.
    data_offset: usize,
}

impl SdkCtlPacket {
    fn new(sdkctl: &Rc<SdkCtlInner>, packet_type: PacketType, buffer: BytesMut, data_offset: usize) -> Self {
        Self {
            inner: Rc::new(PacketInner {
                sdkctl: Rc::downgrade(sdkctl),
                packet_type,
                buffer: RefCell::new(buffer),
                data_offset,
            }),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.inner.packet_type
    }

    /// Payload bytes. Empty while the packet is being written.
    pub fn payload(&self) -> Ref<'_, [u8]> {
        let offset = self.inner.data_offset;
        Ref::map(self.inner.buffer.borrow(), |b| b.get(offset..).unwrap_or(&[]))
    }

    /// Queue the whole buffer for writing with no deadline.
    pub(crate) fn transmit(&self, socket: &AsyncSocket) {
        let buffer = self.inner.buffer.take();
        trace!(packet_type = %self.inner.packet_type, size = buffer.len(), "sending packet");
        let packet = self.clone();
        socket.write_rel(
            IoBuffer::Owned(buffer),
            move |io, state| packet.on_write(io, state),
            None,
        );
    }

    fn on_write(&self, io: &AsyncSocketIo, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Succeeded => trace!(packet_type = %self.inner.packet_type, "packet sent"),
            AsyncIoState::Failed | AsyncIoState::TimedOut => {
                debug!(packet_type = %self.inner.packet_type, %state, error = ?io.last_error(), "packet not sent")
            }
            AsyncIoState::Cancelled => trace!(packet_type = %self.inner.packet_type, "packet cancelled"),
            AsyncIoState::Finished => {
                if let Some(buffer) = io.take_buffer().into_owned() {
                    *self.inner.buffer.borrow_mut() = buffer;
                }
            }
            _ => {}
        }
        AsyncIoAction::Done
    }
}

impl fmt::Debug for SdkCtlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCtlPacket")
            .field("packet_type", &self.inner.packet_type)
            .field("len", &self.inner.buffer.borrow().len())
            .finish()
    }
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(sdkctl) = self.sdkctl.upgrade() {
            sdkctl.free_block(self.buffer.take());
        }
    }
}

// ── SdkCtlMessage ────────────────────────────────────────────────

/// A one-way message, sent or received.
#[derive(Clone)]
pub struct SdkCtlMessage {
    packet: SdkCtlPacket,
    msg_type: i32,
}

impl SdkCtlMessage {
    /// Wrap `buffer`, a complete message packet whose payload starts at
    /// `data_offset`.
    pub(crate) fn new(sdkctl: &SdkCtlSocket, msg_type: i32, buffer: BytesMut, data_offset: usize) -> Self {
        Self {
            packet: SdkCtlPacket::new(&sdkctl.inner, PacketType::Message, buffer, data_offset),
            msg_type,
        }
    }

    /// Wrap a received message body: the message type followed by the
    /// payload, in the host's byte order.
    pub(crate) fn received(sdkctl: &SdkCtlSocket, body: BytesMut) -> Self {
        let msg_type = ByteOrder::native().read_i32(&body[..4]);
        Self::new(sdkctl, msg_type, body, 4)
    }

    pub fn msg_type(&self) -> i32 {
        self.msg_type
    }

    pub fn payload(&self) -> Ref<'_, [u8]> {
        self.packet.payload()
    }

    pub fn packet(&self) -> &SdkCtlPacket {
        &self.packet
    }
}

impl fmt::Debug for SdkCtlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCtlMessage")
            .field("msg_type", &self.msg_type)
            .field("len", &self.payload().len())
            .finish()
    }
}

// ── SdkCtlDirectPacket ───────────────────────────────────────────

/// Transmission callback of a direct packet. Receives `Succeeded`,
/// `Cancelled` or `Failed`.
pub type DirectPacketCallback = Rc<dyn Fn(&SdkCtlDirectPacket, AsyncIoState)>;

/// Sends a caller-built packet without copying it into a recycled block.
#[derive(Clone)]
pub struct SdkCtlDirectPacket {
    inner: Rc<DirectInner>,
}

struct DirectInner {
    sdkctl: Weak<SdkCtlInner>,
    on_sent: RefCell<Option<DirectPacketCallback>>,
}

impl SdkCtlDirectPacket {
    pub fn new(sdkctl: &SdkCtlSocket) -> Self {
        Self {
            inner: Rc::new(DirectInner {
                sdkctl: Rc::downgrade(&sdkctl.inner),
                on_sent: RefCell::new(None),
            }),
        }
    }

    /// Send `data`, which must start with a native-order packet header.
    /// Only the `size` bytes the header declares are written.
    pub fn send<F>(&self, data: Bytes, on_sent: F) -> Result<(), SdkCtlError>
    where
        F: Fn(&SdkCtlDirectPacket, AsyncIoState) + 'static,
    {
        let header = PacketHeader::decode(&data, ByteOrder::native())?;
        let size = header.validate(PacketHeader::SIZE)?;
        if size > data.len() {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: size,
                actual: data.len(),
            });
        }
        let socket = self
            .inner
            .sdkctl
            .upgrade()
            .and_then(|inner| SdkCtlSocket::from_inner(inner).async_socket())
            .ok_or(SdkCtlError::NotConnected)?;

        *self.inner.on_sent.borrow_mut() = Some(Rc::new(on_sent));
        trace!(size, "sending direct packet");
        let packet = self.clone();
        socket.write_rel(
            IoBuffer::Shared(data.slice(..size)),
            move |io, state| packet.on_write(io, state),
            None,
        );
        Ok(())
    }

    fn on_write(&self, io: &AsyncSocketIo, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Succeeded | AsyncIoState::Cancelled | AsyncIoState::Failed => {
                if state == AsyncIoState::Failed {
                    debug!(error = ?io.last_error(), "direct packet failed");
                }
                let on_sent = self.inner.on_sent.borrow().clone();
                if let Some(on_sent) = on_sent {
                    on_sent(self, state);
                }
            }
            _ => {}
        }
        AsyncIoAction::Done
    }
}

impl fmt::Debug for SdkCtlDirectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCtlDirectPacket").finish_non_exhaustive()
    }
}
