//! The protocol session: one `AsyncSocket`, the handshake, the active
//! query list, the dispatcher and the buffer recycler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::error::SdkCtlError;
use crate::header::{ByteOrder, MAX_PACKET_SIZE, MessageHeader, QueryHeader};
use crate::recycler::Recycler;
use crate::socket::AsyncSocket;

use super::dispatcher::IoDispatcher;
use super::handshake;
use super::packet::{SdkCtlDirectPacket, SdkCtlMessage};
use super::port::PortStatus;
use super::query::SdkCtlQuery;

/// Default TCP port of the SDK controller service.
pub const DEFAULT_PORT: u16 = 1970;

/// Receiver of session events.
pub trait SdkCtlHandler {
    /// Connection progress. Answering anything but `Done` to `Succeeded`
    /// refuses the connection; answering `Retry` to `Failed` after a
    /// disconnection reconnects after the reconnect timeout.
    fn on_socket_connection(&self, sdkctl: &SdkCtlSocket, state: AsyncIoState) -> AsyncIoAction;

    /// The service's port status changed.
    fn on_port_connection(&self, sdkctl: &SdkCtlSocket, status: PortStatus);

    /// A message with a non-reserved type arrived.
    fn on_message(&self, sdkctl: &SdkCtlSocket, message: &SdkCtlMessage);
}

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Connected,
}

/// Cloneable handle on a session.
#[derive(Clone)]
pub struct SdkCtlSocket {
    pub(crate) inner: Rc<SdkCtlInner>,
}

pub(crate) struct SdkCtlInner {
    service_name: String,
    reconnect_timeout: Duration,
    handler: Rc<dyn SdkCtlHandler>,
    state: Cell<SocketState>,
    port_status: Cell<PortStatus>,
    socket: RefCell<Option<AsyncSocket>>,
    pub(crate) dispatcher: IoDispatcher,
    queries: RefCell<VecDeque<SdkCtlQuery>>,
    next_query_id: Cell<i32>,
    recycler: RefCell<Recycler>,
    error: Cell<Option<io::ErrorKind>>,
}

impl SdkCtlSocket {
    pub fn new<H>(reconnect_timeout: Duration, service_name: impl Into<String>, handler: H) -> Self
    where
        H: SdkCtlHandler + 'static,
    {
        Self {
            inner: Rc::new(SdkCtlInner {
                service_name: service_name.into(),
                reconnect_timeout,
                handler: Rc::new(handler),
                state: Cell::new(SocketState::Disconnected),
                port_status: Cell::new(PortStatus::PortDisconnected),
                socket: RefCell::new(None),
                dispatcher: IoDispatcher::new(),
                queries: RefCell::new(VecDeque::new()),
                next_query_id: Cell::new(0),
                recycler: RefCell::new(Recycler::disabled()),
                error: Cell::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SdkCtlInner>) -> Self {
        Self { inner }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn state(&self) -> SocketState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get() == SocketState::Connected
    }

    pub fn port_status(&self) -> PortStatus {
        self.inner.port_status.get()
    }

    /// The service is ready to exchange messages.
    pub fn is_port_ready(&self) -> bool {
        self.inner.port_status.get() == PortStatus::PortEnabled
    }

    /// `false` once the service rejected the handshake.
    pub fn is_handshake_ok(&self) -> bool {
        !self.inner.port_status.get().is_handshake_failure()
    }

    /// Cause of the last `Failed` connection report.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.inner.error.get()
    }

    /// The underlying socket, once `connect` has created it.
    pub fn async_socket(&self) -> Option<AsyncSocket> {
        self.inner.socket.borrow().clone()
    }

    /// Number of queries waiting for a reply.
    pub fn active_queries(&self) -> usize {
        self.inner.queries.borrow().len()
    }

    /// Configure the recycler for payloads of up to `data_size` bytes,
    /// keeping at most `max` spare blocks. Only the first call counts.
    pub fn init_recycler(&self, data_size: usize, max: usize) {
        let mut recycler = self.inner.recycler.borrow_mut();
        if recycler.is_configured() {
            debug!(service = %self.inner.service_name, "recycler already configured");
            return;
        }
        *recycler = Recycler::new(data_size + QueryHeader::SIZE, max);
    }

    /// Blocks the recycler had to allocate fresh so far.
    pub fn recycler_fresh_allocations(&self) -> usize {
        self.inner.recycler.borrow().fresh_allocations()
    }

    // ── Connection ───────────────────────────────────────────────

    /// Connect to the service on the loopback interface.
    pub fn connect(&self, port: u16, retry_timeout: Duration) {
        self.connect_to(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), retry_timeout);
    }

    /// Connect to the service at `address`, retrying every
    /// `retry_timeout` until the first connection succeeds.
    pub fn connect_to(&self, address: SocketAddr, retry_timeout: Duration) {
        if self.inner.socket.borrow().is_some() {
            self.disconnect();
        }
        info!(service = %self.inner.service_name, addr = %address, "connecting");
        self.inner.state.set(SocketState::Connecting);

        let weak = Rc::downgrade(&self.inner);
        let socket = AsyncSocket::new(address, self.inner.reconnect_timeout, move |socket, state| {
            match weak.upgrade() {
                Some(inner) => SdkCtlSocket { inner }.on_async_socket_connection(socket, state),
                None => AsyncIoAction::Abort,
            }
        });
        let previous = self.inner.socket.replace(Some(socket.clone()));
        drop(previous);
        socket.connect(retry_timeout);
    }

    /// Drop the session and connect again after `retry_timeout`. A new
    /// port starts over with a fresh socket.
    pub fn reconnect(&self, port: u16, retry_timeout: Duration) {
        let socket = self.async_socket();
        match socket {
            Some(socket) if socket.address().port() == port => {
                self.disconnect_session();
                self.inner.state.set(SocketState::Connecting);
                socket.reconnect(retry_timeout);
            }
            _ => self.connect(port, retry_timeout),
        }
    }

    /// Disconnect, cancelling every pending query and I/O.
    pub fn disconnect(&self) {
        debug!(service = %self.inner.service_name, "disconnect requested");
        self.disconnect_session();
    }

    pub(crate) fn disconnect_session(&self) {
        let socket = self.async_socket();
        if let Some(socket) = socket {
            socket.disconnect();
        }
        self.inner.cancel_all_queries();
        self.inner.dispatcher.reset();
        self.inner.state.set(SocketState::Disconnected);
        self.inner.port_status.set(PortStatus::PortDisconnected);
    }

    /// Tear the session down after a dispatcher or handshake failure and
    /// report it. `Retry` from the client reconnects after the reconnect
    /// timeout.
    pub(crate) fn fail_session(&self, kind: io::ErrorKind) {
        let socket = self.async_socket();
        self.disconnect_session();
        self.set_error(kind);
        let action = self.notify_socket_connection(AsyncIoState::Failed);
        if action != AsyncIoAction::Retry || self.inner.state.get() != SocketState::Disconnected {
            return;
        }
        if let Some(socket) = socket {
            debug!(service = %self.inner.service_name, "reconnecting after failure");
            self.inner.state.set(SocketState::Connecting);
            socket.reconnect(self.inner.reconnect_timeout);
        }
    }

    fn on_async_socket_connection(&self, socket: &AsyncSocket, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Succeeded => self.on_connected(),
            AsyncIoState::Failed if self.inner.state.get() == SocketState::Connected => {
                info!(service = %self.inner.service_name, error = ?socket.last_error(), "connection lost");
                self.inner.error.set(socket.last_error());
                self.disconnect_session();
                let action = match self.notify_socket_connection(AsyncIoState::Failed) {
                    AsyncIoAction::Done => AsyncIoAction::Retry,
                    other => other,
                };
                if action == AsyncIoAction::Retry {
                    self.inner.state.set(SocketState::Connecting);
                }
                action
            }
            AsyncIoState::Failed => {
                debug!(service = %self.inner.service_name, error = ?socket.last_error(), "connect attempt failed");
                AsyncIoAction::Retry
            }
            _ => AsyncIoAction::Retry,
        }
    }

    fn on_connected(&self) -> AsyncIoAction {
        info!(service = %self.inner.service_name, "connected");
        self.inner.state.set(SocketState::Connected);
        self.inner.error.set(None);
        let action = self.notify_socket_connection(AsyncIoState::Succeeded);
        match action {
            AsyncIoAction::Done if self.is_connected() => {
                self.inner.dispatcher.start(self);
                handshake::start(self);
            }
            AsyncIoAction::Done => {}
            AsyncIoAction::Retry => self.inner.state.set(SocketState::Connecting),
            AsyncIoAction::Abort => self.inner.state.set(SocketState::Disconnected),
        }
        action
    }

    // ── Client notifications ─────────────────────────────────────

    pub(crate) fn notify_socket_connection(&self, state: AsyncIoState) -> AsyncIoAction {
        let handler = Rc::clone(&self.inner.handler);
        handler.on_socket_connection(self, state)
    }

    pub(crate) fn notify_port(&self, status: PortStatus) {
        let handler = Rc::clone(&self.inner.handler);
        handler.on_port_connection(self, status);
    }

    pub(crate) fn notify_message(&self, message: &SdkCtlMessage) {
        let handler = Rc::clone(&self.inner.handler);
        handler.on_message(self, message);
    }

    pub(crate) fn set_port_status(&self, status: PortStatus) {
        self.inner.port_status.set(status);
    }

    pub(crate) fn set_error(&self, kind: io::ErrorKind) {
        self.inner.error.set(Some(kind));
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send a one-way message.
    pub fn send_message(&self, msg_type: i32, payload: &[u8]) -> Result<SdkCtlMessage, SdkCtlError> {
        let socket = self.async_socket().ok_or(SdkCtlError::NotConnected)?;
        let size = MessageHeader::SIZE + payload.len();
        if size > MAX_PACKET_SIZE {
            return Err(SdkCtlError::PacketTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }
        let mut buffer = self.inner.alloc_block(size);
        MessageHeader::new(msg_type, payload.len()).encode_into(&mut buffer, ByteOrder::native());
        buffer[MessageHeader::SIZE..].copy_from_slice(payload);

        let message = SdkCtlMessage::new(self, msg_type, buffer, MessageHeader::SIZE);
        message.packet().transmit(&socket);
        Ok(message)
    }

    /// A query with a zeroed payload of `payload_len` bytes and no
    /// callback, to be filled through `payload_mut` before `send`.
    pub fn new_query(&self, query_type: i32, payload_len: usize) -> SdkCtlQuery {
        SdkCtlQuery::new(self, query_type, &vec![0; payload_len], None, None)
    }

    /// A query carrying `payload`. Without a `response` buffer the reply
    /// lands in an internal one.
    pub fn new_query_ex<F>(
        &self,
        query_type: i32,
        payload: &[u8],
        response: Option<BytesMut>,
        callback: F,
    ) -> SdkCtlQuery
    where
        F: Fn(&SdkCtlQuery, AsyncIoState) -> AsyncIoAction + 'static,
    {
        SdkCtlQuery::new(self, query_type, payload, response, Some(Rc::new(callback)))
    }

    /// Build a query and send it in one go.
    pub fn build_and_send_query<F>(
        &self,
        query_type: i32,
        payload: &[u8],
        response: Option<BytesMut>,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<SdkCtlQuery, SdkCtlError>
    where
        F: Fn(&SdkCtlQuery, AsyncIoState) -> AsyncIoAction + 'static,
    {
        let query = self.new_query_ex(query_type, payload, response, callback);
        query.send(timeout)?;
        Ok(query)
    }

    /// A direct packet bound to this session.
    pub fn direct_packet(&self) -> SdkCtlDirectPacket {
        SdkCtlDirectPacket::new(self)
    }
}

impl fmt::Debug for SdkCtlSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCtlSocket")
            .field("service", &self.inner.service_name)
            .field("state", &self.inner.state.get())
            .field("port_status", &self.inner.port_status.get())
            .field("active_queries", &self.active_queries())
            .finish()
    }
}

// ── SdkCtlInner ──────────────────────────────────────────────────

impl SdkCtlInner {
    pub(crate) fn next_query_id(&self) -> i32 {
        let id = self.next_query_id.get().checked_add(1).unwrap_or(1);
        self.next_query_id.set(id);
        id
    }

    pub(crate) fn alloc_block(&self, size: usize) -> BytesMut {
        self.recycler.borrow_mut().alloc(size)
    }

    pub(crate) fn free_block(&self, block: BytesMut) {
        if let Ok(mut recycler) = self.recycler.try_borrow_mut() {
            recycler.free(block);
        }
    }

    pub(crate) fn add_query(&self, query: SdkCtlQuery) {
        self.queries.borrow_mut().push_back(query);
    }

    /// Pull the query with `query_id` out of the active list.
    pub(crate) fn take_query(&self, query_id: i32) -> Option<SdkCtlQuery> {
        let mut queries = self.queries.borrow_mut();
        let index = queries.iter().position(|q| q.query_id() == query_id)?;
        queries.remove(index)
    }

    /// Forget `query`, whether it waits in the active list or is being
    /// completed by the dispatcher.
    pub(crate) fn remove_query(&self, query: &SdkCtlQuery) -> bool {
        if self.dispatcher.release_query(query) {
            return true;
        }
        let removed = {
            let mut queries = self.queries.borrow_mut();
            queries
                .iter()
                .position(|q| q.ptr_eq(query))
                .and_then(|index| queries.remove(index))
        };
        removed.is_some()
    }

    pub(crate) fn cancel_all_queries(&self) {
        loop {
            let next = self.queries.borrow_mut().pop_front();
            let Some(query) = next else {
                break;
            };
            query.on_cancelled();
        }
    }
}

impl Drop for SdkCtlInner {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.get_mut().take() {
            socket.disconnect();
        }
        self.cancel_all_queries();
        self.dispatcher.reset();
    }
}
