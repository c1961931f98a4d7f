//! One queued read or write on an `AsyncSocket`.
//!
//! An `AsyncSocketIo` is shared through `Rc`: the socket's queue holds one
//! reference while the operation is pending and the engine holds another
//! while it calls back into the client. When the last reference goes the
//! callback receives `Finished`, exactly once and last.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::looper::{IoEvents, Timer};
use crate::socket::{AsyncSocket, SocketInner};

/// Per-I/O callback.
pub type IoCallback = Rc<dyn Fn(&AsyncSocketIo, AsyncIoState) -> AsyncIoAction>;

// ── IoDirection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    pub(crate) fn events(self) -> IoEvents {
        match self {
            IoDirection::Read => IoEvents::READ,
            IoDirection::Write => IoEvents::WRITE,
        }
    }
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

// ── IoBuffer ─────────────────────────────────────────────────────

/// Storage an I/O transfers from or into.
///
/// Reads always use an owned buffer. Writes may also send a shared,
/// caller-owned `Bytes` without copying it.
#[derive(Debug)]
pub enum IoBuffer {
    Owned(BytesMut),
    Shared(Bytes),
}

impl IoBuffer {
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            IoBuffer::Owned(b) => &b[..],
            IoBuffer::Shared(b) => &b[..],
        }
    }

    /// The owned buffer, if this is one.
    pub fn into_owned(self) -> Option<BytesMut> {
        match self {
            IoBuffer::Owned(b) => Some(b),
            IoBuffer::Shared(_) => None,
        }
    }
}

impl Default for IoBuffer {
    fn default() -> Self {
        IoBuffer::Owned(BytesMut::new())
    }
}

impl From<BytesMut> for IoBuffer {
    fn from(b: BytesMut) -> Self {
        IoBuffer::Owned(b)
    }
}

impl From<Bytes> for IoBuffer {
    fn from(b: Bytes) -> Self {
        IoBuffer::Shared(b)
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(v: Vec<u8>) -> Self {
        IoBuffer::Shared(Bytes::from(v))
    }
}

// ── AsyncSocketIo ────────────────────────────────────────────────

pub struct AsyncSocketIo {
    socket: Weak<SocketInner>,
    direction: IoDirection,
    buffer: RefCell<IoBuffer>,
    to_transfer: usize,
    transferred: Cell<usize>,
    state: Cell<AsyncIoState>,
    deadline: Option<Instant>,
    pub(crate) timer: Timer,
    error: Cell<Option<io::ErrorKind>>,
    callback: IoCallback,
}

impl AsyncSocketIo {
    pub(crate) fn new(
        socket: Weak<SocketInner>,
        direction: IoDirection,
        buffer: IoBuffer,
        callback: IoCallback,
        deadline: Option<Instant>,
    ) -> Rc<Self> {
        let to_transfer = buffer.len();
        Rc::new(Self {
            socket,
            direction,
            buffer: RefCell::new(buffer),
            to_transfer,
            transferred: Cell::new(0),
            state: Cell::new(AsyncIoState::Queued),
            deadline,
            timer: Timer::new(),
            error: Cell::new(None),
            callback,
        })
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    pub fn is_read(&self) -> bool {
        self.direction == IoDirection::Read
    }

    pub fn state(&self) -> AsyncIoState {
        self.state.get()
    }

    pub fn transferred(&self) -> usize {
        self.transferred.get()
    }

    pub fn to_transfer(&self) -> usize {
        self.to_transfer
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cause of the last `Failed` report.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.error.get()
    }

    /// The socket this I/O was queued on, while it is alive.
    pub fn socket(&self) -> Option<AsyncSocket> {
        self.socket.upgrade().map(AsyncSocket::from_inner)
    }

    /// The whole buffer. For a read only `transferred()` bytes are filled.
    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.buffer.borrow(), IoBuffer::as_slice)
    }

    /// Take the buffer out, leaving an empty one behind.
    pub fn take_buffer(&self) -> IoBuffer {
        self.buffer.take()
    }

    /// Stop the deadline timer. The operation then never times out.
    pub fn cancel_timeout(&self) {
        self.timer.stop();
    }

    pub(crate) fn remaining(&self) -> usize {
        self.to_transfer - self.transferred.get()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn advance(&self, n: usize) {
        self.transferred.set(self.transferred.get() + n);
    }

    pub(crate) fn set_error(&self, kind: io::ErrorKind) {
        self.error.set(Some(kind));
    }

    /// Record `state` and hand it to the client.
    pub(crate) fn notify(&self, state: AsyncIoState) -> AsyncIoAction {
        self.state.set(state);
        let callback = Rc::clone(&self.callback);
        callback(self, state)
    }

    /// One non-blocking `recv`/`send` for the untransferred tail.
    pub(crate) fn transfer(&self, stream: &TcpStream) -> io::Result<usize> {
        let range = self.transferred.get()..self.to_transfer;
        if range.is_empty() {
            return Ok(0);
        }
        let mut buffer = self.buffer.borrow_mut();
        if buffer.len() < range.end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer taken while the transfer was pending",
            ));
        }
        match (self.direction, &mut *buffer) {
            (IoDirection::Read, IoBuffer::Owned(b)) => stream.try_read(&mut b[range]),
            (IoDirection::Read, IoBuffer::Shared(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read into a shared buffer",
            )),
            (IoDirection::Write, b) => stream.try_write(&b.as_slice()[range]),
        }
    }
}

impl fmt::Debug for AsyncSocketIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocketIo")
            .field("direction", &self.direction)
            .field("state", &self.state.get())
            .field("transferred", &self.transferred.get())
            .field("to_transfer", &self.to_transfer)
            .finish()
    }
}

impl Drop for AsyncSocketIo {
    fn drop(&mut self) {
        self.timer.stop();
        self.notify(AsyncIoState::Finished);
    }
}
