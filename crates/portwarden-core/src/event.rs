/*!
 * Event system for Portwarden.
 *
 * Ports, governors and the security layer publish on one [`SharedEventBus`].
 * Every payload type gets its own bounded `tokio::sync::broadcast` channel,
 * created on first use. Producers never block: a receiver that falls more
 * than the channel capacity behind loses the oldest events and resumes from
 * the oldest one retained.
 *
 * Most payloads travel in a [`TypedEvent`] envelope stamped with the id of
 * the port or governor that raised it. A [`SourceReceiver`] follows a single
 * source on a bus shared by many.
 */
use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::{Id, Timestamp};

/// Default number of events retained per channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Urgency of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Routine bookkeeping
    Low = 0,
    /// State changes in normal operation
    #[default]
    Normal = 1,
    /// Failures a governor is expected to act on
    High = 2,
    /// The port or the hierarchy cannot continue as configured
    Critical = 3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Envelope carrying a payload with its source and urgency
#[derive(Debug, Clone)]
pub struct TypedEvent<T: Clone + Debug + Send + Sync + 'static> {
    /// Dotted event name, e.g. `port.error`
    pub event_type: &'static str,
    /// Port or governor that raised it
    pub source: Option<Id>,
    /// Urgency
    pub priority: Priority,
    /// When it was raised
    pub timestamp: Timestamp,
    /// Payload
    pub payload: T,
}

impl<T: Clone + Debug + Send + Sync + 'static> TypedEvent<T> {
    /// Wrap `payload`, stamped now with normal priority
    pub fn new(event_type: &'static str, payload: T) -> Self {
        Self {
            event_type,
            source: None,
            priority: Priority::Normal,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// Stamp the raising port or governor
    pub fn with_source(mut self, source: Id) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the urgency
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a governor should look at this before its next cycle
    pub fn is_urgent(&self) -> bool {
        self.priority >= Priority::High
    }

    /// Whether `source` raised this event
    pub fn is_from(&self, source: &Id) -> bool {
        self.source.as_ref() == Some(source)
    }
}

/// Receiver half handed out by [`EventBus::subscribe`]
pub type EventReceiver<T> = broadcast::Receiver<T>;

/// Typed channels keyed by payload type
#[derive(Debug)]
pub struct EventBus {
    channels: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a bus with the default channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus retaining `capacity` events per channel
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            channel_capacity: capacity.max(1),
        }
    }

    fn sender<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<broadcast::Sender<T>> {
        let entry = self.channels.entry(TypeId::of::<T>()).or_insert_with(|| {
            debug!("Opening event channel for {}", std::any::type_name::<T>());
            let sender: Box<dyn Any + Send + Sync> =
                Box::new(broadcast::channel::<T>(self.channel_capacity).0);
            sender
        });
        entry
            .downcast_ref::<broadcast::Sender<T>>()
            .cloned()
            .ok_or_else(|| Error::event(format!("channel type mismatch for {}", std::any::type_name::<T>())))
    }

    /// Publish an event, returning the number of receivers it reached.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let reached = self.sender::<T>()?.send(event).unwrap_or(0);
        trace!("Published {} to {} receivers", std::any::type_name::<T>(), reached);
        Ok(reached)
    }

    /// Subscribe to every event of type `T`
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }

    /// Subscribe to `TypedEvent<T>` raised by `source` only
    pub fn subscribe_source<T: Clone + Debug + Send + Sync + 'static>(
        &self,
        source: Id,
    ) -> Result<SourceReceiver<T>> {
        Ok(SourceReceiver {
            source,
            inner: self.subscribe::<TypedEvent<T>>()?,
            missed: 0,
        })
    }

    /// Live receivers of type `T`
    pub fn subscriber_count<T: Clone + Debug + Send + Sync + 'static>(&self) -> usize {
        self.channels
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<broadcast::Sender<T>>().map(|s| s.receiver_count()))
            .unwrap_or(0)
    }

    /// Number of payload types seen so far
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Events of one source from a shared channel.
///
/// Events from other sources are skipped. Events lost to lag are counted
/// rather than reported as errors; an observer that needs every event must
/// keep up or use a larger capacity.
#[derive(Debug)]
pub struct SourceReceiver<T: Clone + Debug + Send + Sync + 'static> {
    source: Id,
    inner: EventReceiver<TypedEvent<T>>,
    missed: u64,
}

impl<T: Clone + Debug + Send + Sync + 'static> SourceReceiver<T> {
    /// Source being followed
    pub fn source(&self) -> &Id {
        &self.source
    }

    /// Events of any source dropped because this receiver lagged
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event from the source; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<TypedEvent<T>> {
        loop {
            match self.inner.recv().await {
                Ok(event) if event.is_from(&self.source) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => self.missed += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event from the source already buffered, if any
    pub fn try_recv(&mut self) -> Option<TypedEvent<T>> {
        loop {
            match self.inner.try_recv() {
                Ok(event) if event.is_from(&self.source) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Cloneable handle to one [`EventBus`]
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a bus with the default channel capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus retaining `capacity` events per channel
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// The bus itself
    pub fn bus(&self) -> &EventBus {
        &self.0
    }

    /// Publish an event
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to every event of type `T`
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }

    /// Subscribe to `TypedEvent<T>` raised by `source` only
    pub fn subscribe_source<T: Clone + Debug + Send + Sync + 'static>(
        &self,
        source: Id,
    ) -> Result<SourceReceiver<T>> {
        self.0.subscribe_source(source)
    }
}
