//! Type-safe event bus for in-process pub/sub.
//!
//! The [`EventBus`] lets the chunk stores and chunk sources emit typed
//! events (batch started, chunk loaded, chunk booted, chunk lost...) that
//! statistics collectors and tests subscribe to without direct coupling.
//!
//! # Design
//!
//! Each event type is a distinct struct implementing the [`Event`] marker trait.
//! Internally, the bus maintains a `HashMap<TypeId, Box<dyn Any>>` where each
//! value is a `tokio::sync::broadcast::Sender<E>`. Channels are created lazily
//! on the first `subscribe()` for a given type.
//!
//! Emitting never blocks and never needs a runtime, so the blocking install
//! worker can emit freely. Receivers can either `recv().await` or poll with
//! [`EventReceiver::try_recv`].
//!
//! # Example
//!
//! ```rust
//! use salvage_types::ChunkId;
//! use salvage_types::events::{ChunkLost, EventBus};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<ChunkLost>();
//!
//! bus.emit(ChunkLost {
//!     chunk_id: ChunkId::from_u128(1),
//! });
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.chunk_id, ChunkId::from_u128(1));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::ChunkId;

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Result of one attempt to rebuild a chunk from an installed build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadOutcome {
    /// The chunk was rebuilt, verified and placed in the store.
    Success,
    /// No installed build knows the chunk.
    NotFound,
    /// The manifest records neither a strong nor a weak hash.
    MissingHashInfo,
    /// The manifest lists no usable fragments.
    MissingPartInfo,
    /// A source file could not be opened.
    OpenFileFail,
    /// A source file is shorter than the fragments require.
    IncorrectFileSize,
    /// The rebuilt bytes did not match the recorded hash.
    HashCheckFailed,
    /// The load was abandoned because the source was aborted.
    Aborted,
}

/// A reconstruction batch has been planned.
#[derive(Clone, Debug)]
pub struct BatchStarted {
    /// Chunks in load order.
    pub chunks: Vec<ChunkId>,
}
impl Event for BatchStarted {}

/// A chunk load from an installed build has begun.
#[derive(Clone, Debug)]
pub struct ChunkLoadStarted {
    /// The chunk being rebuilt.
    pub chunk_id: ChunkId,
}
impl Event for ChunkLoadStarted {}

/// A chunk load from an installed build has finished.
#[derive(Clone, Debug)]
pub struct ChunkLoadCompleted {
    /// The chunk that was attempted.
    pub chunk_id: ChunkId,
    /// How the attempt ended.
    pub outcome: LoadOutcome,
    /// Bytes read from disk during the attempt.
    pub bytes_read: u64,
}
impl Event for ChunkLoadCompleted {}

/// A source reported chunks it can no longer supply.
#[derive(Clone, Debug)]
pub struct ChunksUnavailable {
    /// The unavailable chunks.
    pub chunks: Vec<ChunkId>,
}
impl Event for ChunksUnavailable {}

/// A still-referenced chunk was pushed out of a memory store.
#[derive(Clone, Debug)]
pub struct ChunkBooted {
    /// The booted chunk.
    pub chunk_id: ChunkId,
    /// Whether an overflow store took the chunk.
    pub to_overflow: bool,
}
impl Event for ChunkBooted {}

/// A chunk with no remaining references was dropped from a store.
#[derive(Clone, Debug)]
pub struct ChunkCleaned {
    /// The dropped chunk.
    pub chunk_id: ChunkId,
}
impl Event for ChunkCleaned {}

/// A chunk became unrecoverable from a store.
#[derive(Clone, Debug)]
pub struct ChunkLost {
    /// The lost chunk.
    pub chunk_id: ChunkId,
}
impl Event for ChunkLost {}

/// A chunk read back from disk failed verification.
#[derive(Clone, Debug)]
pub struct ChunkCorrupted {
    /// The corrupted chunk.
    pub chunk_id: ChunkId,
}
impl Event for ChunkCorrupted {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Inner state of the event bus, protected by a mutex.
///
/// Each entry maps a `TypeId` to a type-erased `broadcast::Sender<E>`.
struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus.
///
/// Clonable (`Arc` inside). Thread-safe. Non-blocking emits.
///
/// Each event type gets its own independent `tokio::broadcast` channel,
/// so subscribers of `ChunkLost` never receive `BatchStarted` events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// If nobody subscribed to `E`, the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&type_id)
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // An error only means there are no live receivers.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    ///
    /// The channel is created lazily if it doesn't exist yet.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has been dropped. Skips over lagged
    /// events with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
