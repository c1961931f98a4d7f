//! Completion states and client answers shared by every asynchronous
//! object in the engine: connectors, socket I/O, queries and packets.

use std::fmt;

// ── AsyncIoState ─────────────────────────────────────────────────

/// State reported to a callback.
///
/// Per-I/O callbacks see `Started → Continues* → {Succeeded | Failed |
/// TimedOut | Cancelled} → Finished`. Connection callbacks see `Started`,
/// `Continues`, `Retrying`, `Succeeded` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncIoState {
    /// Queued, not yet touched by the event loop.
    Queued,
    /// First readiness event (or a connection attempt is about to start).
    Started,
    /// Further progress on a started operation.
    Continues,
    /// Completed successfully.
    Succeeded,
    /// Failed. The owner's `last_error()` holds the cause while the
    /// callback runs.
    Failed,
    /// The deadline expired.
    TimedOut,
    /// Cancelled by a disconnect or by destruction of the owner.
    Cancelled,
    /// A retry timer fired and a new attempt is about to begin.
    Retrying,
    /// The object is being released. Always the last notification.
    Finished,
}

impl AsyncIoState {
    /// `true` for the states after which a queued operation leaves its queue.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AsyncIoState::Succeeded
                | AsyncIoState::Failed
                | AsyncIoState::TimedOut
                | AsyncIoState::Cancelled
        )
    }
}

impl fmt::Display for AsyncIoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AsyncIoState::Queued => "QUEUED",
            AsyncIoState::Started => "STARTED",
            AsyncIoState::Continues => "CONTINUES",
            AsyncIoState::Succeeded => "SUCCEEDED",
            AsyncIoState::Failed => "FAILED",
            AsyncIoState::TimedOut => "TIMED_OUT",
            AsyncIoState::Cancelled => "CANCELLED",
            AsyncIoState::Retrying => "RETRYING",
            AsyncIoState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

// ── AsyncIoAction ────────────────────────────────────────────────

/// A callback's answer to the state it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncIoAction {
    /// Accept the state and carry on.
    Done,
    /// Abandon the operation.
    Abort,
    /// Keep the operation (or the connection attempt) alive and try again.
    Retry,
}

impl fmt::Display for AsyncIoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncIoAction::Done => write!(f, "DONE"),
            AsyncIoAction::Abort => write!(f, "ABORT"),
            AsyncIoAction::Retry => write!(f, "RETRY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(AsyncIoState::Succeeded.is_terminal());
        assert!(AsyncIoState::Cancelled.is_terminal());
        assert!(!AsyncIoState::Started.is_terminal());
        assert!(!AsyncIoState::Finished.is_terminal());
    }

    #[test]
    fn display_names() {
        assert_eq!(AsyncIoState::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!(AsyncIoAction::Retry.to_string(), "RETRY");
    }
}
