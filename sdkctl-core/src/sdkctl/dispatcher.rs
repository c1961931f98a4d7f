//! The single reader of a session's socket.
//!
//! ```text
//!            ┌──────────────► ExpectHeader ◄──────────────────┐
//!            │                 │         │                    │
//!            │   MESSAGE/QUERY │         │ QUERY_RESPONSE     │
//!            │                 ▼         ▼                    │
//!            └──────────── ExpectData   ExpectQueryReplyHeader│
//!                                          │                  │
//!                                          ▼                  │
//!                                 ExpectQueryReplyData ───────┘
//! ```
//!
//! Every read is issued without a deadline. A failed read or a framing
//! error ends the session; a cancelled read drops whatever was half
//! received.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bytes::BytesMut;
use tracing::{debug, error, trace, warn};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::error::SdkCtlError;
use crate::header::{ByteOrder, MessageHeader, PacketHeader, PacketType, QueryHeader, QueryReplyHeader};
use crate::socket_io::AsyncSocketIo;

use super::packet::SdkCtlMessage;
use super::port::PortStatus;
use super::query::SdkCtlQuery;
use super::socket::SdkCtlSocket;

/// Length of the query id that follows the generic header of a reply.
const REPLY_ID_SIZE: usize = QueryReplyHeader::SIZE - PacketHeader::SIZE;

#[derive(Debug, Default)]
enum DispatcherState {
    #[default]
    Idle,
    ExpectHeader,
    ExpectData {
        header: PacketHeader,
    },
    ExpectQueryReplyHeader {
        payload_len: usize,
    },
    /// `query` is `None` when the reply matched nothing and is drained.
    ExpectQueryReplyData {
        query_id: i32,
        query: Option<SdkCtlQuery>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct IoDispatcher {
    state: RefCell<DispatcherState>,
}

impl IoDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start reading packets on a freshly connected session.
    pub(crate) fn start(&self, sdkctl: &SdkCtlSocket) {
        self.reset();
        trace!(service = %sdkctl.service_name(), "dispatcher started");
        self.read_header(sdkctl);
    }

    /// Go idle, cancelling the query whose reply was being read.
    pub(crate) fn reset(&self) {
        let previous = self.state.take();
        if let DispatcherState::ExpectQueryReplyData {
            query: Some(query), ..
        } = previous
        {
            debug!(query_id = query.query_id(), "reply read interrupted");
            query.on_cancelled();
        }
    }

    /// Let go of `query` if its reply is being read right now. The reply
    /// is then drained.
    pub(crate) fn release_query(&self, query: &SdkCtlQuery) -> bool {
        let released = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                DispatcherState::ExpectQueryReplyData { query: slot, .. }
                    if slot.as_ref().is_some_and(|q| q.ptr_eq(query)) =>
                {
                    slot.take()
                }
                _ => None,
            }
        };
        released.is_some()
    }

    fn on_io(&self, sdkctl: &SdkCtlSocket, io: &AsyncSocketIo, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Started => io.cancel_timeout(),
            AsyncIoState::Succeeded => {
                let buffer = io.take_buffer().into_owned().unwrap_or_default();
                self.on_read(sdkctl, buffer);
            }
            AsyncIoState::Failed | AsyncIoState::TimedOut => {
                let kind = io.last_error().unwrap_or(io::ErrorKind::TimedOut);
                debug!(service = %sdkctl.service_name(), %state, error = ?kind, "dispatcher read failed");
                sdkctl.fail_session(kind);
            }
            AsyncIoState::Cancelled => {
                trace!(service = %sdkctl.service_name(), "dispatcher read cancelled");
                self.reset();
            }
            AsyncIoState::Finished => {
                if let Some(buffer) = io.take_buffer().into_owned() {
                    sdkctl.inner.free_block(buffer);
                }
            }
            _ => {}
        }
        AsyncIoAction::Done
    }

    /// Enter `next` and read into `buffer`. An empty buffer completes at
    /// once.
    fn expect(&self, sdkctl: &SdkCtlSocket, next: DispatcherState, buffer: BytesMut) {
        let previous = self.state.replace(next);
        drop(previous);
        if buffer.is_empty() {
            self.on_read(sdkctl, buffer);
            return;
        }
        let Some(socket) = sdkctl.async_socket() else {
            self.state.take();
            return;
        };
        let weak = Rc::downgrade(&sdkctl.inner);
        socket.read_abs(
            buffer,
            move |io, state| match weak.upgrade() {
                Some(inner) => {
                    let sdkctl = SdkCtlSocket::from_inner(inner);
                    sdkctl.inner.dispatcher.on_io(&sdkctl, io, state)
                }
                None => AsyncIoAction::Abort,
            },
            None,
        );
    }

    fn read_header(&self, sdkctl: &SdkCtlSocket) {
        let buffer = sdkctl.inner.alloc_block(PacketHeader::SIZE);
        self.expect(sdkctl, DispatcherState::ExpectHeader, buffer);
    }

    /// Read the next header unless a callback closed the session.
    fn resume(&self, sdkctl: &SdkCtlSocket) {
        let idle = matches!(*self.state.borrow(), DispatcherState::Idle);
        if idle && sdkctl.is_connected() {
            self.read_header(sdkctl);
        }
    }

    fn on_read(&self, sdkctl: &SdkCtlSocket, buffer: BytesMut) {
        match self.state.take() {
            DispatcherState::ExpectHeader => self.on_header(sdkctl, buffer),
            DispatcherState::ExpectData { header } => self.on_packet(sdkctl, header, buffer),
            DispatcherState::ExpectQueryReplyHeader { payload_len } => {
                self.on_reply_header(sdkctl, payload_len, buffer)
            }
            DispatcherState::ExpectQueryReplyData { query_id, query } => {
                self.on_reply_data(sdkctl, query_id, query, buffer)
            }
            DispatcherState::Idle => {
                debug!(service = %sdkctl.service_name(), "read completed while idle");
                sdkctl.inner.free_block(buffer);
            }
        }
    }

    fn on_header(&self, sdkctl: &SdkCtlSocket, buffer: BytesMut) {
        let decoded = PacketHeader::decode(&buffer, ByteOrder::native());
        sdkctl.inner.free_block(buffer);
        let checked = decoded.and_then(|header| {
            let min_size = match PacketType::try_from(header.packet_type) {
                Ok(PacketType::Message) => MessageHeader::SIZE,
                Ok(PacketType::Query) => QueryHeader::SIZE,
                Ok(PacketType::QueryResponse) => QueryReplyHeader::SIZE,
                Err(_) => PacketHeader::SIZE,
            };
            header.validate(min_size).map(|size| (header, size))
        });
        let (header, size) = match checked {
            Ok(checked) => checked,
            Err(e) => return self.on_protocol_error(sdkctl, e),
        };
        trace!(size, packet_type = header.packet_type, "packet header");

        if header.packet_type == PacketType::QueryResponse as i32 {
            let id = sdkctl.inner.alloc_block(REPLY_ID_SIZE);
            let payload_len = size - QueryReplyHeader::SIZE;
            self.expect(sdkctl, DispatcherState::ExpectQueryReplyHeader { payload_len }, id);
        } else {
            let body = sdkctl.inner.alloc_block(size - PacketHeader::SIZE);
            self.expect(sdkctl, DispatcherState::ExpectData { header }, body);
        }
    }

    fn on_packet(&self, sdkctl: &SdkCtlSocket, header: PacketHeader, body: BytesMut) {
        match PacketType::try_from(header.packet_type) {
            Ok(PacketType::Message) => {
                let message = SdkCtlMessage::received(sdkctl, body);
                trace!(msg_type = message.msg_type(), len = message.payload().len(), "message");
                match PortStatus::from_port_message(message.msg_type()) {
                    Some(status) => {
                        debug!(service = %sdkctl.service_name(), %status, "port status");
                        sdkctl.set_port_status(status);
                        sdkctl.notify_port(status);
                    }
                    None => sdkctl.notify_message(&message),
                }
            }
            Ok(PacketType::Query) => {
                warn!(service = %sdkctl.service_name(), size = header.size, "query from the service dropped");
                sdkctl.inner.free_block(body);
            }
            _ => {
                warn!(packet_type = header.packet_type, size = header.size, "unknown packet type dropped");
                sdkctl.inner.free_block(body);
            }
        }
        self.resume(sdkctl);
    }

    fn on_reply_header(&self, sdkctl: &SdkCtlSocket, payload_len: usize, buffer: BytesMut) {
        let query_id = ByteOrder::native().read_i32(&buffer[..REPLY_ID_SIZE]);
        sdkctl.inner.free_block(buffer);

        let next = match sdkctl.inner.take_query(query_id) {
            Some(query) => {
                query.cancel_timeout();
                let response = query.response_buffer(payload_len);
                (Some(query), response)
            }
            None => {
                debug!(query_id, payload_len, "reply to an unknown query, draining");
                (None, sdkctl.inner.alloc_block(payload_len))
            }
        };
        let (query, buffer) = next;
        self.expect(sdkctl, DispatcherState::ExpectQueryReplyData { query_id, query }, buffer);
    }

    fn on_reply_data(
        &self,
        sdkctl: &SdkCtlSocket,
        query_id: i32,
        query: Option<SdkCtlQuery>,
        buffer: BytesMut,
    ) {
        match query {
            Some(query) => query.complete(buffer),
            None => {
                trace!(query_id, len = buffer.len(), "unmatched reply drained");
                sdkctl.inner.free_block(buffer);
            }
        }
        self.resume(sdkctl);
    }

    fn on_protocol_error(&self, sdkctl: &SdkCtlSocket, err: SdkCtlError) {
        error!(service = %sdkctl.service_name(), error = %err, "protocol violation");
        sdkctl.fail_session(err.kind());
    }
}
