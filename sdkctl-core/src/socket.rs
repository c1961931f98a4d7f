//! A persistent, reconnecting TCP connection with FIFO read and write
//! queues driven by socket readiness.
//!
//! Each readiness event makes exactly one `recv`/`send` attempt for the
//! operation at the head of that direction's queue. Interest in a
//! direction stays armed only while its queue is non-empty.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::connector::AsyncSocketConnector;
use crate::looper::{self, IoEvents, IoWatch, Timer};
use crate::socket_io::{AsyncSocketIo, IoBuffer, IoCallback, IoDirection};

/// Connection callback.
pub type ConnectionCallback = Rc<dyn Fn(&AsyncSocket, AsyncIoState) -> AsyncIoAction>;

type IoQueue = RefCell<VecDeque<Rc<AsyncSocketIo>>>;

/// Cloneable handle on a socket. The socket lives while any handle does.
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Rc<SocketInner>,
}

pub(crate) struct SocketInner {
    address: SocketAddr,
    reconnect_timeout: Duration,
    on_connection: ConnectionCallback,
    /// `Some` exactly while connected.
    watch: RefCell<Option<IoWatch>>,
    readers: IoQueue,
    writers: IoQueue,
    connector: RefCell<Option<AsyncSocketConnector>>,
    reconnect_timer: Timer,
    error: Cell<Option<io::ErrorKind>>,
}

impl AsyncSocket {
    pub fn new<F>(address: SocketAddr, reconnect_timeout: Duration, on_connection: F) -> Self
    where
        F: Fn(&AsyncSocket, AsyncIoState) -> AsyncIoAction + 'static,
    {
        Self {
            inner: Rc::new(SocketInner {
                address,
                reconnect_timeout,
                on_connection: Rc::new(on_connection),
                watch: RefCell::new(None),
                readers: IoQueue::default(),
                writers: IoQueue::default(),
                connector: RefCell::new(None),
                reconnect_timer: Timer::new(),
                error: Cell::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SocketInner>) -> Self {
        Self { inner }
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn reconnect_timeout(&self) -> Duration {
        self.inner.reconnect_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.inner.watch.borrow().is_some()
    }

    /// Cause of the last `Failed` connection report.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.inner.error.get()
    }

    /// Number of reads waiting in the queue.
    pub fn pending_reads(&self) -> usize {
        self.inner.readers.borrow().len()
    }

    /// Number of writes waiting in the queue.
    pub fn pending_writes(&self) -> usize {
        self.inner.writers.borrow().len()
    }

    pub fn ptr_eq(&self, other: &AsyncSocket) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Connection ───────────────────────────────────────────────

    /// Start connecting, retrying every `retry_timeout` for as long as the
    /// connection callback answers `Retry`.
    pub fn connect(&self, retry_timeout: Duration) {
        if self.is_connected() {
            debug!(addr = %self.inner.address, "already connected, dropping the old connection");
            self.inner.cancel_all_io();
            self.inner.close();
        }
        let weak = Rc::downgrade(&self.inner);
        let connector =
            AsyncSocketConnector::new(self.inner.address, retry_timeout, move |connector, state| {
                match weak.upgrade() {
                    Some(inner) => AsyncSocket { inner }.on_connector_event(connector, state),
                    None => AsyncIoAction::Abort,
                }
            });
        let previous = self.inner.connector.replace(Some(connector.clone()));
        drop(previous);
        connector.connect();
    }

    /// Cancel all I/O and close the connection. The socket stays usable
    /// for a later `connect`.
    pub fn disconnect(&self) {
        debug!(addr = %self.inner.address, "disconnecting");
        let connector = self.inner.connector.take();
        drop(connector);
        self.inner.cancel_all_io();
        self.inner.close();
    }

    /// Disconnect, then connect again after `retry_timeout`.
    pub fn reconnect(&self, retry_timeout: Duration) {
        debug!(addr = %self.inner.address, delay = ?retry_timeout, "reconnecting");
        self.disconnect();
        self.schedule_reconnect(retry_timeout);
    }

    fn schedule_reconnect(&self, delay: Duration) {
        self.inner.cancel_all_io();
        let weak = Rc::downgrade(&self.inner);
        self.inner.reconnect_timer.start_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                let socket = AsyncSocket { inner };
                socket.connect(socket.inner.reconnect_timeout);
            }
        });
    }

    fn notify_connection(&self, state: AsyncIoState) -> AsyncIoAction {
        let callback = Rc::clone(&self.inner.on_connection);
        callback(self, state)
    }

    fn on_connector_event(
        &self,
        connector: &AsyncSocketConnector,
        state: AsyncIoState,
    ) -> AsyncIoAction {
        let action = match state {
            AsyncIoState::Succeeded => {
                let Some(stream) = connector.pull_stream() else {
                    return AsyncIoAction::Abort;
                };
                self.attach(stream);
                self.inner.error.set(None);
                let action = self.notify_connection(AsyncIoState::Succeeded);
                if action != AsyncIoAction::Done {
                    debug!(addr = %self.inner.address, %action, "connection refused by client");
                    self.inner.cancel_all_io();
                    self.inner.close();
                }
                action
            }
            AsyncIoState::Failed => {
                self.inner.error.set(connector.last_error());
                self.notify_connection(AsyncIoState::Failed)
            }
            other => self.notify_connection(other),
        };

        let finished = action == AsyncIoAction::Abort
            || (matches!(state, AsyncIoState::Succeeded | AsyncIoState::Failed)
                && action != AsyncIoAction::Retry);
        if finished {
            let released = {
                let mut slot = self.inner.connector.borrow_mut();
                if slot.as_ref().is_some_and(|c| c.ptr_eq(connector)) {
                    slot.take()
                } else {
                    None
                }
            };
            drop(released);
        }
        action
    }

    fn attach(&self, stream: TcpStream) {
        let weak = Rc::downgrade(&self.inner);
        let watch = IoWatch::new(Rc::new(stream), move |events| {
            if let Some(inner) = weak.upgrade() {
                AsyncSocket { inner }.on_io(events);
            }
        });
        let previous = self.inner.watch.replace(Some(watch));
        drop(previous);
    }

    fn on_disconnected(&self, kind: io::ErrorKind) {
        debug!(addr = %self.inner.address, error = ?kind, "disconnected");
        self.inner.cancel_all_io();
        self.inner.close();
        self.inner.error.set(Some(kind));
        if self.notify_connection(AsyncIoState::Failed) == AsyncIoAction::Retry {
            self.schedule_reconnect(self.inner.reconnect_timeout);
        }
    }

    // ── I/O submission ───────────────────────────────────────────

    /// Read exactly `buffer.len()` bytes into `buffer` by `deadline`.
    pub fn read_abs<F>(&self, buffer: BytesMut, callback: F, deadline: Option<Instant>)
    where
        F: Fn(&AsyncSocketIo, AsyncIoState) -> AsyncIoAction + 'static,
    {
        self.submit(
            IoDirection::Read,
            IoBuffer::Owned(buffer),
            Rc::new(callback),
            deadline,
        );
    }

    /// Like [`read_abs`](Self::read_abs) with a timeout relative to now.
    pub fn read_rel<F>(&self, buffer: BytesMut, callback: F, timeout: Option<Duration>)
    where
        F: Fn(&AsyncSocketIo, AsyncIoState) -> AsyncIoAction + 'static,
    {
        self.read_abs(buffer, callback, looper::deadline(timeout));
    }

    /// Write the whole of `buffer` by `deadline`.
    pub fn write_abs<B, F>(&self, buffer: B, callback: F, deadline: Option<Instant>)
    where
        B: Into<IoBuffer>,
        F: Fn(&AsyncSocketIo, AsyncIoState) -> AsyncIoAction + 'static,
    {
        self.submit(IoDirection::Write, buffer.into(), Rc::new(callback), deadline);
    }

    /// Like [`write_abs`](Self::write_abs) with a timeout relative to now.
    pub fn write_rel<B, F>(&self, buffer: B, callback: F, timeout: Option<Duration>)
    where
        B: Into<IoBuffer>,
        F: Fn(&AsyncSocketIo, AsyncIoState) -> AsyncIoAction + 'static,
    {
        self.write_abs(buffer, callback, looper::deadline(timeout));
    }

    fn submit(
        &self,
        direction: IoDirection,
        buffer: IoBuffer,
        callback: IoCallback,
        deadline: Option<Instant>,
    ) {
        let io = AsyncSocketIo::new(
            Rc::downgrade(&self.inner),
            direction,
            buffer,
            callback,
            deadline,
        );
        if let Some(deadline) = deadline {
            let weak_io = Rc::downgrade(&io);
            let weak_socket = Rc::downgrade(&self.inner);
            io.timer.start_at(deadline, move || {
                if let (Some(io), Some(inner)) = (weak_io.upgrade(), weak_socket.upgrade()) {
                    AsyncSocket { inner }.on_io_timed_out(&io);
                }
            });
        }

        if self.is_connected() {
            trace!(addr = %self.inner.address, %direction, len = io.to_transfer(), "queued");
            self.inner.queue(direction).borrow_mut().push_back(Rc::clone(&io));
            self.inner.want(direction.events());
        } else {
            debug!(addr = %self.inner.address, %direction, "I/O on a disconnected socket");
            io.cancel_timeout();
            io.set_error(io::ErrorKind::ConnectionReset);
            io.notify(AsyncIoState::Failed);
        }
    }

    // ── Event handling ───────────────────────────────────────────

    fn on_io_timed_out(&self, io: &Rc<AsyncSocketIo>) {
        debug!(addr = %self.inner.address, direction = %io.direction(), "I/O timed out");
        let position = self.inner.remove_io(io);
        if io.notify(AsyncIoState::TimedOut) == AsyncIoAction::Retry {
            if let Some(position) = position {
                self.inner.reinsert_io(io, position);
            }
        }
    }

    fn on_io(&self, events: IoEvents) {
        if events.contains(IoEvents::READ) && self.on_ready(IoDirection::Read).is_err() {
            return;
        }
        if events.contains(IoEvents::WRITE) {
            let _ = self.on_ready(IoDirection::Write);
        }
    }

    /// Serve the head of `direction`'s queue. `Err` means the connection
    /// broke or the operation failed, and the other direction is skipped.
    fn on_ready(&self, direction: IoDirection) -> Result<(), ()> {
        let head = self.inner.queue(direction).borrow().front().cloned();
        let Some(io) = head else {
            debug!(addr = %self.inner.address, %direction, "readiness with nothing queued");
            self.inner.dont_want(direction.events());
            return Ok(());
        };

        let state = if io.state() == AsyncIoState::Queued {
            AsyncIoState::Started
        } else {
            AsyncIoState::Continues
        };
        if io.notify(state) == AsyncIoAction::Abort {
            trace!(addr = %self.inner.address, %direction, "aborted by client");
            self.inner.remove_io(&io);
            self.inner.rearm(direction);
            return Ok(());
        }

        let Some(stream) = self.inner.stream() else {
            return Err(());
        };
        let result = loop {
            match io.transfer(&stream) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) if !io.is_complete() => {
                self.on_disconnected(io::ErrorKind::ConnectionReset);
                Err(())
            }
            Ok(n) => {
                io.advance(n);
                trace!(
                    addr = %self.inner.address,
                    %direction,
                    transferred = io.transferred(),
                    to_transfer = io.to_transfer(),
                    "transfer"
                );
                if io.is_complete() {
                    self.inner.remove_io(&io);
                    io.cancel_timeout();
                    io.notify(AsyncIoState::Succeeded);
                }
                self.inner.rearm(direction);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.inner.want(direction.events());
                Ok(())
            }
            Err(e) => {
                debug!(addr = %self.inner.address, %direction, error = %e, "I/O failed");
                io.set_error(e.kind());
                let position = self.inner.remove_io(&io);
                if io.notify(AsyncIoState::Failed) == AsyncIoAction::Retry {
                    if let Some(position) = position {
                        self.inner.reinsert_io(&io, position);
                    }
                }
                self.inner.rearm(direction);
                Err(())
            }
        }
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("address", &self.inner.address)
            .field("connected", &self.is_connected())
            .field("readers", &self.pending_reads())
            .field("writers", &self.pending_writes())
            .finish()
    }
}

// ── SocketInner ──────────────────────────────────────────────────

impl SocketInner {
    fn queue(&self, direction: IoDirection) -> &IoQueue {
        match direction {
            IoDirection::Read => &self.readers,
            IoDirection::Write => &self.writers,
        }
    }

    fn stream(&self) -> Option<Rc<TcpStream>> {
        self.watch.borrow().as_ref().map(|w| Rc::clone(w.stream()))
    }

    fn want(&self, events: IoEvents) {
        if let Some(watch) = self.watch.borrow().as_ref() {
            watch.want(events);
        }
    }

    fn dont_want(&self, events: IoEvents) {
        if let Some(watch) = self.watch.borrow().as_ref() {
            watch.dont_want(events);
        }
    }

    fn rearm(&self, direction: IoDirection) {
        if !self.queue(direction).borrow().is_empty() {
            self.want(direction.events());
        }
    }

    /// Unlink `io` from its queue, wherever it sits, and return where it
    /// was.
    fn remove_io(&self, io: &Rc<AsyncSocketIo>) -> Option<usize> {
        let (position, removed) = {
            let mut queue = self.queue(io.direction()).borrow_mut();
            match queue.iter().position(|queued| Rc::ptr_eq(queued, io)) {
                Some(index) => (Some(index), queue.remove(index)),
                None => (None, None),
            }
        };
        drop(removed);
        position
    }

    /// Put back an operation the client chose to keep after a failure.
    fn reinsert_io(&self, io: &Rc<AsyncSocketIo>, position: usize) {
        if self.watch.borrow().is_none() {
            return;
        }
        {
            let mut queue = self.queue(io.direction()).borrow_mut();
            let position = position.min(queue.len());
            queue.insert(position, Rc::clone(io));
        }
        self.want(io.direction().events());
    }

    fn cancel_queue(&self, direction: IoDirection) {
        loop {
            let next = self.queue(direction).borrow_mut().pop_front();
            let Some(io) = next else {
                break;
            };
            io.cancel_timeout();
            io.notify(AsyncIoState::Cancelled);
        }
    }

    fn cancel_all_io(&self) {
        self.reconnect_timer.stop();
        self.dont_want(IoEvents::all());
        self.cancel_queue(IoDirection::Read);
        self.cancel_queue(IoDirection::Write);
    }

    fn close(&self) {
        let watch = self.watch.take();
        if watch.is_some() {
            debug!(addr = %self.address, "socket closed");
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.cancel_all_io();
        self.close();
    }
}
