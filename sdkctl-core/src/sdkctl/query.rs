//! Queries: requests that wait for a reply carrying the same query id.
//!
//! A sent query sits in the session's active list until the dispatcher
//! pulls it out to complete it, its deadline passes, or a disconnect
//! cancels it. The deadline timer is only armed once the request has been
//! written, so a slow write is reported by the write itself.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::error::SdkCtlError;
use crate::header::{ByteOrder, QueryHeader};
use crate::looper::{self, Timer};
use crate::socket_io::{AsyncSocketIo, IoBuffer};

use super::socket::{SdkCtlInner, SdkCtlSocket};

/// Query completion callback.
pub type QueryCallback = Rc<dyn Fn(&SdkCtlQuery, AsyncIoState) -> AsyncIoAction>;

#[derive(Clone)]
pub struct SdkCtlQuery {
    inner: Rc<QueryInner>,
}

struct QueryInner {
    sdkctl: Weak<SdkCtlInner>,
    query_id: i32,
    query_type: i32,
    /// Header and payload. Empty while the write owns it.
    request: RefCell<BytesMut>,
    deadline: Cell<Option<Instant>>,
    timer: Timer,
    callback: RefCell<Option<QueryCallback>>,
    response: RefCell<BytesMut>,
    response_size: Cell<usize>,
    owns_response: bool,
    /// Set once a final outcome has been reported.
    finished: Cell<bool>,
}

impl SdkCtlQuery {
    pub(crate) fn new(
        sdkctl: &SdkCtlSocket,
        query_type: i32,
        payload: &[u8],
        response: Option<BytesMut>,
        callback: Option<QueryCallback>,
    ) -> Self {
        let query_id = sdkctl.inner.next_query_id();
        let mut request = sdkctl.inner.alloc_block(QueryHeader::SIZE + payload.len());
        QueryHeader::new(query_id, query_type, payload.len())
            .encode_into(&mut request, ByteOrder::native());
        request[QueryHeader::SIZE..].copy_from_slice(payload);

        let owns_response = response.is_none();
        Self {
            inner: Rc::new(QueryInner {
                sdkctl: Rc::downgrade(&sdkctl.inner),
                query_id,
                query_type,
                request: RefCell::new(request),
                deadline: Cell::new(None),
                timer: Timer::new(),
                callback: RefCell::new(callback),
                response: RefCell::new(response.unwrap_or_default()),
                response_size: Cell::new(0),
                owns_response,
                finished: Cell::new(false),
            }),
        }
    }

    pub fn query_id(&self) -> i32 {
        self.inner.query_id
    }

    pub fn query_type(&self) -> i32 {
        self.inner.query_type
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.get()
    }

    pub fn ptr_eq(&self, other: &SdkCtlQuery) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&SdkCtlQuery, AsyncIoState) -> AsyncIoAction + 'static,
    {
        *self.inner.callback.borrow_mut() = Some(Rc::new(callback));
    }

    /// Request payload. Empty while the request is being written.
    pub fn payload(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.request.borrow(), |r| r.get(QueryHeader::SIZE..).unwrap_or(&[]))
    }

    pub fn payload_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.inner.request.borrow_mut(), |r| {
            r.get_mut(QueryHeader::SIZE..).unwrap_or(&mut [])
        })
    }

    /// Reply payload received so far.
    pub fn response(&self) -> Ref<'_, [u8]> {
        let size = self.inner.response_size.get();
        Ref::map(self.inner.response.borrow(), |r| &r[..size.min(r.len())])
    }

    pub fn response_size(&self) -> usize {
        self.inner.response_size.get()
    }

    /// Take the reply buffer, trimmed to the reply size.
    pub fn take_response(&self) -> BytesMut {
        let mut response = self.inner.response.take();
        response.truncate(self.inner.response_size.get());
        self.inner.response_size.set(0);
        response
    }

    /// Write the request and wait up to `timeout` for its reply. `None`
    /// waits forever.
    pub fn send(&self, timeout: Option<Duration>) -> Result<(), SdkCtlError> {
        let sdkctl = self
            .inner
            .sdkctl
            .upgrade()
            .map(SdkCtlSocket::from_inner)
            .ok_or(SdkCtlError::NotConnected)?;
        let socket = sdkctl.async_socket().ok_or(SdkCtlError::NotConnected)?;
        let request = self.inner.request.take();
        if request.is_empty() {
            return Err(SdkCtlError::Other(format!(
                "query {} is already in flight",
                self.inner.query_id
            )));
        }

        let deadline = looper::deadline(timeout);
        self.inner.deadline.set(deadline);
        self.inner.finished.set(false);
        sdkctl.inner.add_query(self.clone());
        trace!(query_id = self.inner.query_id, query_type = self.inner.query_type, "sending query");

        let query = self.clone();
        socket.write_abs(
            IoBuffer::Owned(request),
            move |io, state| query.on_write(io, state),
            deadline,
        );
        Ok(())
    }

    /// Stop the reply deadline.
    pub fn cancel_timeout(&self) {
        self.inner.timer.stop();
    }

    fn on_write(&self, io: &AsyncSocketIo, state: AsyncIoState) -> AsyncIoAction {
        match state {
            AsyncIoState::Succeeded => {
                let action = self.notify(AsyncIoState::Continues);
                self.arm_timer();
                action
            }
            AsyncIoState::Cancelled => {
                self.remove_from_session();
                self.on_cancelled();
                AsyncIoAction::Done
            }
            AsyncIoState::TimedOut | AsyncIoState::Failed => {
                debug!(query_id = self.inner.query_id, %state, "query write did not complete");
                self.notify_failure(state)
            }
            AsyncIoState::Finished => {
                if let Some(request) = io.take_buffer().into_owned() {
                    *self.inner.request.borrow_mut() = request;
                }
                AsyncIoAction::Done
            }
            _ => AsyncIoAction::Done,
        }
    }

    fn arm_timer(&self) {
        let Some(deadline) = self.inner.deadline.get() else {
            return;
        };
        let weak = Rc::downgrade(&self.inner);
        self.inner.timer.start_at(deadline, move || {
            if let Some(inner) = weak.upgrade() {
                SdkCtlQuery { inner }.on_timeout();
            }
        });
    }

    fn on_timeout(&self) {
        debug!(query_id = self.inner.query_id, "query timed out");
        self.notify_failure(AsyncIoState::TimedOut);
    }

    /// Report a failure. The query is out of the active list while the
    /// callback runs and only goes back on `Retry` to a live session.
    fn notify_failure(&self, state: AsyncIoState) -> AsyncIoAction {
        let removed = self.remove_from_session();
        let action = self.notify(state);
        if action == AsyncIoAction::Retry && removed {
            if let Some(sdkctl) = self.inner.sdkctl.upgrade() {
                if SdkCtlSocket::from_inner(Rc::clone(&sdkctl)).is_connected() {
                    sdkctl.add_query(self.clone());
                }
            }
        }
        action
    }

    fn remove_from_session(&self) -> bool {
        self.inner
            .sdkctl
            .upgrade()
            .is_some_and(|sdkctl| sdkctl.remove_query(self))
    }

    /// Report the outcome to the client. A query that already reported a
    /// final outcome stays silent.
    pub(crate) fn notify(&self, state: AsyncIoState) -> AsyncIoAction {
        if self.inner.finished.get() {
            return AsyncIoAction::Done;
        }
        if matches!(state, AsyncIoState::Succeeded | AsyncIoState::Cancelled) {
            self.inner.finished.set(true);
        }
        let callback = self.inner.callback.borrow().clone();
        let action = match callback {
            Some(callback) => callback(self, state),
            None => AsyncIoAction::Done,
        };
        if matches!(state, AsyncIoState::Failed | AsyncIoState::TimedOut)
            && action != AsyncIoAction::Retry
        {
            self.inner.finished.set(true);
        }
        action
    }

    pub(crate) fn on_cancelled(&self) {
        self.cancel_timeout();
        self.notify(AsyncIoState::Cancelled);
    }

    /// A buffer of exactly `size` bytes to read the reply into.
    pub(crate) fn response_buffer(&self, size: usize) -> BytesMut {
        let mut buffer = self.inner.response.take();
        if buffer.capacity() == 0 && self.inner.owns_response {
            if let Some(sdkctl) = self.inner.sdkctl.upgrade() {
                return sdkctl.alloc_block(size);
            }
        }
        buffer.resize(size, 0);
        buffer
    }

    /// Store the reply and report success.
    pub(crate) fn complete(&self, response: BytesMut) {
        self.cancel_timeout();
        self.inner.response_size.set(response.len());
        *self.inner.response.borrow_mut() = response;
        trace!(query_id = self.inner.query_id, size = self.inner.response_size.get(), "query completed");
        self.notify(AsyncIoState::Succeeded);
    }
}

impl fmt::Debug for SdkCtlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkCtlQuery")
            .field("query_id", &self.inner.query_id)
            .field("query_type", &self.inner.query_type)
            .field("response_size", &self.inner.response_size.get())
            .finish()
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        self.timer.stop();
        let Some(sdkctl) = self.sdkctl.upgrade() else {
            return;
        };
        sdkctl.free_block(self.request.take());
        if self.owns_response {
            sdkctl.free_block(self.response.take());
        }
    }
}
