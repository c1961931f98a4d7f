//! Connect-with-retry state machine producing a connected `TcpStream`.
//!
//! ```text
//! connect() ──► STARTED ──► attempt ──► CONTINUES ──► SUCCEEDED ─► pull_stream()
//!                              ▲                  └─► FAILED
//!                              │                        │ RETRY
//!                              └──── RETRYING ◄── timer ┘
//! ```
//!
//! The callback's answer drives the next step; there is no retry bound.
//! The in-flight attempt and the retry timer only hold weak references,
//! so dropping the last handle stops everything and closes an unpulled
//! stream.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::asio::{AsyncIoAction, AsyncIoState};
use crate::looper::Timer;

pub type ConnectorCallback = Rc<dyn Fn(&AsyncSocketConnector, AsyncIoState) -> AsyncIoAction>;

#[derive(Clone)]
pub struct AsyncSocketConnector {
    inner: Rc<ConnectorInner>,
}

struct ConnectorInner {
    address: SocketAddr,
    retry_timeout: Duration,
    callback: ConnectorCallback,
    stream: RefCell<Option<TcpStream>>,
    attempt: RefCell<Option<JoinHandle<()>>>,
    retry_timer: Timer,
    error: Cell<Option<io::ErrorKind>>,
    attempts: Cell<u32>,
}

impl AsyncSocketConnector {
    pub fn new<F>(address: SocketAddr, retry_timeout: Duration, callback: F) -> Self
    where
        F: Fn(&AsyncSocketConnector, AsyncIoState) -> AsyncIoAction + 'static,
    {
        Self {
            inner: Rc::new(ConnectorInner {
                address,
                retry_timeout,
                callback: Rc::new(callback),
                stream: RefCell::new(None),
                attempt: RefCell::new(None),
                retry_timer: Timer::new(),
                error: Cell::new(None),
                attempts: Cell::new(0),
            }),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn retry_timeout(&self) -> Duration {
        self.inner.retry_timeout
    }

    /// Cause of the last `Failed` report.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.inner.error.get()
    }

    /// Number of connect attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.get()
    }

    pub fn ptr_eq(&self, other: &AsyncSocketConnector) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take ownership of the connected stream. Returns `None` before a
    /// successful connection or once the stream has been pulled.
    pub fn pull_stream(&self) -> Option<TcpStream> {
        self.inner.stream.borrow_mut().take()
    }

    /// Start connecting. The callback sees `Started` before the socket is
    /// opened, so a socket that cannot be opened reports `Failed` after it.
    pub fn connect(&self) {
        if self.notify(AsyncIoState::Started) == AsyncIoAction::Abort {
            debug!(addr = %self.inner.address, "connection aborted by client");
            return;
        }
        match open_socket(&self.inner.address) {
            Ok(socket) => self.start_attempt(socket),
            Err(e) => self.on_connecting(Err(e)),
        }
    }

    fn notify(&self, state: AsyncIoState) -> AsyncIoAction {
        let callback = Rc::clone(&self.inner.callback);
        callback(self, state)
    }

    fn start_attempt(&self, socket: TcpSocket) {
        self.inner.attempts.set(self.inner.attempts.get() + 1);
        let address = self.inner.address;
        let weak = Rc::downgrade(&self.inner);
        let handle = tokio::task::spawn_local(async move {
            let result = socket.connect(address).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.attempt.borrow_mut().take();
            let connector = AsyncSocketConnector { inner };
            if connector.notify(AsyncIoState::Continues) == AsyncIoAction::Abort {
                debug!(addr = %address, "connection aborted by client");
                return;
            }
            connector.on_connecting(result);
        });
        let previous = self.inner.attempt.replace(Some(handle));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn on_connecting(&self, result: io::Result<TcpStream>) {
        let address = self.inner.address;
        let action = match result {
            Ok(stream) => {
                debug!(addr = %address, "connected");
                self.inner.error.set(None);
                *self.inner.stream.borrow_mut() = Some(stream);
                self.notify(AsyncIoState::Succeeded)
            }
            Err(e) => {
                debug!(addr = %address, error = %e, "connection attempt failed");
                self.inner.error.set(Some(e.kind()));
                self.notify(AsyncIoState::Failed)
            }
        };

        match action {
            AsyncIoAction::Retry => {
                debug!(addr = %address, delay = ?self.inner.retry_timeout, "retrying connection");
                let weak = Rc::downgrade(&self.inner);
                self.inner
                    .retry_timer
                    .start_after(self.inner.retry_timeout, move || {
                        if let Some(inner) = weak.upgrade() {
                            AsyncSocketConnector { inner }.on_retry();
                        }
                    });
            }
            AsyncIoAction::Abort => debug!(addr = %address, "connection aborted by client"),
            AsyncIoAction::Done => {}
        }
    }

    fn on_retry(&self) {
        if self.notify(AsyncIoState::Retrying) == AsyncIoAction::Abort {
            debug!(addr = %self.inner.address, "retry aborted by client");
            return;
        }
        // A stream left over from an earlier attempt is closed here.
        self.inner.stream.borrow_mut().take();
        match open_socket(&self.inner.address) {
            Ok(socket) => self.start_attempt(socket),
            Err(e) => self.on_connecting(Err(e)),
        }
    }
}

impl fmt::Debug for AsyncSocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocketConnector")
            .field("address", &self.inner.address)
            .field("attempts", &self.inner.attempts.get())
            .finish()
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.get_mut().take() {
            attempt.abort();
        }
        self.retry_timer.stop();
    }
}

fn open_socket(address: &SocketAddr) -> io::Result<TcpSocket> {
    if address.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn connects_and_hands_over_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        LocalSet::new()
            .run_until(async move {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                let connector =
                    AsyncSocketConnector::new(address, Duration::from_millis(50), move |_, state| {
                        tx.send(state).ok();
                        AsyncIoAction::Done
                    });
                connector.connect();
                let _accepted = listener.accept().await.unwrap();

                let mut seen = Vec::new();
                while let Some(state) = rx.recv().await {
                    seen.push(state);
                    if state == AsyncIoState::Succeeded {
                        break;
                    }
                }
                assert_eq!(seen.first(), Some(&AsyncIoState::Started));
                assert!(connector.pull_stream().is_some());
                assert!(connector.pull_stream().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn abort_on_started_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        LocalSet::new()
            .run_until(async move {
                let connector =
                    AsyncSocketConnector::new(address, Duration::from_millis(50), |_, _| {
                        AsyncIoAction::Abort
                    });
                connector.connect();
                assert_eq!(connector.attempts(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn failed_attempt_reports_started_first() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        LocalSet::new()
            .run_until(async move {
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                let connector =
                    AsyncSocketConnector::new(address, Duration::from_millis(50), move |_, state| {
                        tx.send(state).ok();
                        AsyncIoAction::Done
                    });
                connector.connect();

                let mut seen = Vec::new();
                while let Some(state) = rx.recv().await {
                    seen.push(state);
                    if state == AsyncIoState::Failed {
                        break;
                    }
                }
                assert_eq!(
                    seen,
                    vec![AsyncIoState::Started, AsyncIoState::Continues, AsyncIoState::Failed]
                );
                assert!(connector.last_error().is_some());
                assert!(connector.pull_stream().is_none());
            })
            .await;
    }
}
