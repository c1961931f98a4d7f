//! Timer and readiness primitives for the single-threaded engine.
//!
//! Everything here runs on tokio's `LocalSet`: timers and readiness waits
//! are `spawn_local` tasks whose handles are aborted on stop. Callers must
//! create and drive engine objects from inside a `LocalSet`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Current monotonic time.
pub fn now() -> Instant {
    Instant::now()
}

/// Convert a relative timeout into an absolute deadline. `None` means
/// the operation never expires.
pub fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| now() + t)
}

type TaskSlot = Rc<RefCell<Option<JoinHandle<()>>>>;

fn abort_slot(slot: &TaskSlot) {
    let handle = slot.borrow_mut().take();
    if let Some(handle) = handle {
        handle.abort();
    }
}

// ── Timer ────────────────────────────────────────────────────────

/// A one-shot timer.
///
/// Starting a timer that is already pending discards the pending expiry.
/// The timer is inactive by the time its closure runs, so the closure may
/// start it again.
#[derive(Debug, Default)]
pub struct Timer {
    slot: TaskSlot,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `on_expired` at `deadline`.
    pub fn start_at<F>(&self, deadline: Instant, on_expired: F)
    where
        F: FnOnce() + 'static,
    {
        self.stop();
        let slot = Rc::downgrade(&self.slot);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(slot) = slot.upgrade() else {
                return;
            };
            slot.borrow_mut().take();
            on_expired();
        });
        *self.slot.borrow_mut() = Some(handle);
    }

    /// Fire `on_expired` after `delay`.
    pub fn start_after<F>(&self, delay: Duration, on_expired: F)
    where
        F: FnOnce() + 'static,
    {
        self.start_at(now() + delay, on_expired);
    }

    pub fn stop(&self) {
        abort_slot(&self.slot);
    }

    pub fn is_active(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── IoWatch ──────────────────────────────────────────────────────

bitflags! {
    /// Readiness directions a watch can be interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoEvents: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Readiness registration on a connected stream.
///
/// Interest is one-shot per direction: once the stream becomes ready the
/// interest is cleared and the handler runs with the ready direction. A
/// handler that still wants events re-arms them.
pub struct IoWatch {
    stream: Rc<TcpStream>,
    handler: Rc<dyn Fn(IoEvents)>,
    read: TaskSlot,
    write: TaskSlot,
}

impl IoWatch {
    pub fn new<F>(stream: Rc<TcpStream>, handler: F) -> Self
    where
        F: Fn(IoEvents) + 'static,
    {
        Self {
            stream,
            handler: Rc::new(handler),
            read: TaskSlot::default(),
            write: TaskSlot::default(),
        }
    }

    pub fn stream(&self) -> &Rc<TcpStream> {
        &self.stream
    }

    /// Arm interest in `events`. Directions already armed are left alone.
    pub fn want(&self, events: IoEvents) {
        if events.contains(IoEvents::READ) {
            self.arm(&self.read, IoEvents::READ);
        }
        if events.contains(IoEvents::WRITE) {
            self.arm(&self.write, IoEvents::WRITE);
        }
    }

    /// Drop interest in `events`.
    pub fn dont_want(&self, events: IoEvents) {
        if events.contains(IoEvents::READ) {
            abort_slot(&self.read);
        }
        if events.contains(IoEvents::WRITE) {
            abort_slot(&self.write);
        }
    }

    /// The directions currently armed.
    pub fn wants(&self) -> IoEvents {
        let mut events = IoEvents::empty();
        if self.read.borrow().is_some() {
            events |= IoEvents::READ;
        }
        if self.write.borrow().is_some() {
            events |= IoEvents::WRITE;
        }
        events
    }

    fn arm(&self, slot: &TaskSlot, event: IoEvents) {
        if slot.borrow().is_some() {
            return;
        }
        let stream = Rc::clone(&self.stream);
        let handler = Rc::clone(&self.handler);
        let weak = Rc::downgrade(slot);
        let handle = tokio::task::spawn_local(async move {
            let ready = if event == IoEvents::READ {
                stream.readable().await
            } else {
                stream.writable().await
            };
            if let Err(e) = ready {
                // The following recv/send surfaces the error.
                trace!(?event, error = %e, "readiness wait failed");
            }
            let Some(slot) = weak.upgrade() else {
                return;
            };
            slot.borrow_mut().take();
            handler(event);
        });
        *slot.borrow_mut() = Some(handle);
    }
}

impl Drop for IoWatch {
    fn drop(&mut self) {
        abort_slot(&self.read);
        abort_slot(&self.write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once() {
        LocalSet::new()
            .run_until(async {
                let fired = Rc::new(Cell::new(0));
                let timer = Timer::new();
                let counter = Rc::clone(&fired);
                timer.start_after(Duration::from_millis(50), move || {
                    counter.set(counter.get() + 1)
                });
                assert!(timer.is_active());

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(fired.get(), 1);
                assert!(!timer.is_active());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        LocalSet::new()
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                let timer = Timer::new();
                let flag = Rc::clone(&fired);
                timer.start_after(Duration::from_millis(50), move || flag.set(true));
                timer.stop();

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_pending_expiry() {
        LocalSet::new()
            .run_until(async {
                let hits = Rc::new(RefCell::new(Vec::new()));
                let timer = Timer::new();
                let first = Rc::clone(&hits);
                timer.start_after(Duration::from_millis(10), move || {
                    first.borrow_mut().push("first")
                });
                let second = Rc::clone(&hits);
                timer.start_after(Duration::from_millis(20), move || {
                    second.borrow_mut().push("second")
                });

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(*hits.borrow(), vec!["second"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timer_never_fires() {
        LocalSet::new()
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                {
                    let timer = Timer::new();
                    let flag = Rc::clone(&fired);
                    timer.start_after(Duration::from_millis(5), move || flag.set(true));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[test]
    fn infinite_deadline() {
        assert!(deadline(None).is_none());
    }
}
