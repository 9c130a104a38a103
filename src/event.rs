//! Observability / event fan-out (C14).
//!
//! An [`EventEmitter`] wraps the `log` facade as its base tracer. [`EventEmitter::emit`] always
//! issues a `log::debug!`/`log::info!` line (severity depends on event kind) and, if at least one
//! subscriber is registered, copies the event into every subscriber's bounded channel. This means
//! a host application gets useful output from `RUST_LOG=agentdock=debug` with zero subscribers
//! attached — logging, not subscriber fan-out, is the baseline signal, mirroring the donor
//! crate's [`EventHandler`] trait whose default methods are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentdock::event::{EventEmitter, RuntimeEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let emitter = EventEmitter::new();
//! let (subscriber_id, mut rx) = emitter.subscribe(16);
//! emitter.emit(RuntimeEvent::CacheExpired { key: "unified_gmail_abc123".to_string() });
//! let event = rx.recv().await.unwrap();
//! println!("{:?}", event);
//! emitter.unsubscribe(subscriber_id);
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// One event in the runtime's taxonomy.
///
/// Every variant carries enough identifying information (trace id, span id, session id) for a
/// subscriber to reconstruct causality without consulting external state.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// An incremental chunk of assistant text produced during streaming.
    StreamingChunk {
        trace_id: String,
        span_id: String,
        session_id: String,
        text: String,
        is_thinking: bool,
    },
    /// A tool call (virtual, custom, or MCP) is about to be dispatched.
    ToolCallStart {
        trace_id: String,
        span_id: String,
        parent_id: Option<String>,
        session_id: String,
        tool_name: String,
        call_id: String,
    },
    /// A tool call finished, successfully or not.
    ToolCallEnd {
        trace_id: String,
        span_id: String,
        parent_id: Option<String>,
        session_id: String,
        tool_name: String,
        call_id: String,
        success: bool,
        error: Option<String>,
    },
    /// History summarization began.
    ContextSummarizationStarted {
        trace_id: String,
        session_id: String,
        history_len: usize,
    },
    /// History summarization completed; `summary` is the synthetic user message text.
    ContextSummarizationCompleted {
        trace_id: String,
        session_id: String,
        summary: String,
        kept_messages: usize,
    },
    /// History summarization failed; the original history was left untouched.
    ContextSummarizationError {
        trace_id: String,
        session_id: String,
        error: String,
    },
    /// A Tool Catalog Cache entry expired and was evicted from memory.
    CacheExpired { key: String },
}

impl RuntimeEvent {
    /// Log level to use when emitting this event through the `log` facade.
    fn log_level(&self) -> log::Level {
        match self {
            RuntimeEvent::ContextSummarizationError { .. } => log::Level::Warn,
            RuntimeEvent::ToolCallEnd { success: false, .. } => log::Level::Warn,
            RuntimeEvent::StreamingChunk { .. } => log::Level::Debug,
            _ => log::Level::Info,
        }
    }
}

/// Handle returned by [`EventEmitter::subscribe`]; pass back to
/// [`EventEmitter::unsubscribe`] to tear the subscription down early. Subscriptions are also
/// dropped automatically once the receiver is dropped or the owning task's cancellation token
/// fires, since `emit` treats a full/closed channel as a dead subscriber on its next send.
pub type SubscriberId = u64;

/// Fan-out size for each subscriber's bounded channel. Chosen generously enough that a slow
/// consumer does not immediately start dropping events under normal load, while still bounding
/// memory if a consumer stalls entirely.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Event emitter shared across an [`Agent`](crate::agent::Agent) and its
/// [`Controller`](crate::controller::Controller). Cheap to clone (`Arc` internally via
/// `DashMap`); typically held as a single instance per agent and handed out by reference.
pub struct EventEmitter {
    subscribers: DashMap<SubscriberId, mpsc::Sender<RuntimeEvent>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    /// Construct an emitter with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber with the given bounded channel capacity and return its id plus
    /// the receiving half.
    pub fn subscribe(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<RuntimeEvent>) {
        let capacity = if capacity == 0 {
            SUBSCRIBER_CHANNEL_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber. Safe to call more than once or with an unknown id.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Emit an event: always log it, then fan out to every live subscriber.
    ///
    /// Uses `try_send` per §5's non-blocking publication rule — a full or closed subscriber
    /// channel is dropped silently (closed channels are pruned) rather than blocking the caller.
    /// Missing an event is preferable to stalling the LLM loop.
    pub fn emit(&self, event: RuntimeEvent) {
        match event.log_level() {
            log::Level::Warn => log::warn!("agentdock event: {:?}", event),
            log::Level::Debug => log::debug!("agentdock event: {:?}", event),
            _ => log::info!("agentdock event: {:?}", event),
        }

        if self.subscribers.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("agentdock event: dropping event for slow subscriber {}", entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Tear down every subscriber. Called when the owning agent/session closes.
    pub fn close(&self) {
        self.subscribers.clear();
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let emitter = EventEmitter::new();
        let (_id, mut rx) = emitter.subscribe(4);
        emitter.emit(RuntimeEvent::CacheExpired {
            key: "unified_a_b".to_string(),
        });
        let event = rx.recv().await.unwrap();
        match event {
            RuntimeEvent::CacheExpired { key } => assert_eq!(key, "unified_a_b"),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let emitter = EventEmitter::new();
        let (id, mut rx) = emitter.subscribe(4);
        emitter.unsubscribe(id);
        emitter.emit(RuntimeEvent::CacheExpired {
            key: "x".to_string(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new();
        emitter.emit(RuntimeEvent::ContextSummarizationError {
            trace_id: "t1".to_string(),
            session_id: "s1".to_string(),
            error: "boom".to_string(),
        });
    }

    #[tokio::test]
    async fn close_clears_all_subscribers() {
        let emitter = EventEmitter::new();
        let (_id1, _rx1) = emitter.subscribe(4);
        let (_id2, _rx2) = emitter.subscribe(4);
        emitter.close();
        assert_eq!(emitter.subscribers.len(), 0);
    }
}
