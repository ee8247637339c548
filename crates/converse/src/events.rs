//! UI event plumbing.
//!
//! The agent loop reports progress through an [`EventSink`], a
//! best-effort wrapper around an unbounded channel: a dropped receiver
//! never fails the loop, it just stops being told. A [`ViewGuard`] lets
//! the host suppress events when the user has navigated away from the
//! conversation — the stream keeps assembling and persisting, only the
//! notifications stop.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::content::RenderingBlockGroup;
use crate::message::Message;
use crate::usage::ChatTotals;

/// A progress notification for the UI.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum UiEvent {
    /// A model stream began.
    StreamingStart,
    /// The rendering groups changed; carries a full snapshot.
    GroupsUpdate {
        /// The groups assembled so far.
        groups: Vec<RenderingBlockGroup>,
    },
    /// The model stream ended (one round, not the whole loop).
    StreamingEnd,
    /// A message was persisted and appended to the conversation.
    MessageAppended {
        /// The appended message.
        message: Message,
    },
    /// Conversation totals changed.
    ChatMetadataChanged {
        /// Updated running totals.
        totals: ChatTotals,
        /// Context-window occupancy after the latest call, if known.
        context_window_tokens: Option<u64>,
    },
    /// A tool invocation started.
    ToolStarted {
        /// The tool-use id.
        id: String,
        /// The tool name.
        name: String,
    },
    /// Progress from a streaming tool.
    ToolProgress {
        /// The tool-use id.
        id: String,
        /// Progress label.
        label: String,
    },
    /// A tool invocation finished.
    ToolFinished {
        /// The tool-use id.
        id: String,
        /// Whether the tool reported an error.
        is_error: bool,
        /// Wall-clock duration of the invocation.
        duration_ms: u64,
    },
}

/// Decides whether the originating view is still on screen.
///
/// When it is not, [`EventSink::emit`] drops events instead of sending
/// them. Only notifications are affected; assembly and persistence
/// continue regardless.
pub trait ViewGuard: Send + Sync {
    /// `true` while the view that started the loop is still current.
    fn is_current(&self) -> bool;
}

impl<F> ViewGuard for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_current(&self) -> bool {
        self()
    }
}

/// A [`ViewGuard`] that never suppresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCurrent;

impl ViewGuard for AlwaysCurrent {
    fn is_current(&self) -> bool {
        true
    }
}

/// Best-effort emitter of [`UiEvent`]s.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<UiEvent>>,
    guard: Arc<dyn ViewGuard>,
}

impl EventSink {
    /// A sink that always delivers to `tx` (while the view is current
    /// by definition).
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self {
            tx: Some(tx),
            guard: Arc::new(AlwaysCurrent),
        }
    }

    /// A sink guarded by `guard`.
    pub fn with_guard(tx: mpsc::UnboundedSender<UiEvent>, guard: Arc<dyn ViewGuard>) -> Self {
        Self {
            tx: Some(tx),
            guard,
        }
    }

    /// A sink that delivers nothing, for headless use and tests.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            guard: Arc::new(AlwaysCurrent),
        }
    }

    /// Sends `event` if a receiver exists and the view is current.
    /// Never fails.
    pub fn emit(&self, event: UiEvent) {
        if !self.guard.is_current() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("connected", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_emit_delivers_when_current() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(UiEvent::StreamingStart);
        assert_eq!(rx.try_recv().unwrap(), UiEvent::StreamingStart);
    }

    #[test]
    fn test_emit_suppressed_by_guard() {
        static CURRENT: AtomicBool = AtomicBool::new(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::with_guard(tx, Arc::new(|| CURRENT.load(Ordering::Relaxed)));

        sink.emit(UiEvent::StreamingStart);
        CURRENT.store(false, Ordering::Relaxed);
        sink.emit(UiEvent::StreamingEnd);

        assert_eq!(rx.try_recv().unwrap(), UiEvent::StreamingStart);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(tx);
        sink.emit(UiEvent::StreamingStart);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled().emit(UiEvent::StreamingEnd);
    }
}
