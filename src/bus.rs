//! In-memory event bus - typed publish/subscribe
//!
//! Subscribers register per [`EventKind`] and receive pool-allocated deep
//! clones over bounded channels. Delivery never blocks the publisher: a
//! full subscriber buffer drops that delivery and surfaces `Unavailable`,
//! a vanished subscriber is discarded silently. Every received event must
//! go back to the recycler exactly once (the consumer wrapper does this
//! automatically).
//!
//! A subscriber channel is closed exactly once: when its owner
//! unsubscribes, its shutdown signal fires, or the bus closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::core_types::SubscriptionId;
use crate::error::CoreError;
use crate::event::{Event, EventKind};
use crate::pool::Recycler;
use crate::shutdown::Shutdown;

struct SubscriberEntry {
    id: SubscriptionId,
    tx: mpsc::Sender<Box<Event>>,
}

/// Typed pub/sub hub. Cheap to clone via `Arc` at the call sites that
/// need it; internally sharded by kind.
pub struct EventBus {
    /// kind -> active subscriber senders
    subscribers: DashMap<EventKind, Vec<SubscriberEntry>>,
    /// id -> kind, for idempotent unsubscribe
    by_id: DashMap<SubscriptionId, EventKind>,
    next_id: AtomicU64,
    buffer_size: usize,
    closed: AtomicBool,
    /// Bus-level signal observed by the per-subscription observer tasks.
    bus_shutdown: Shutdown,
    recycler: Arc<Recycler>,
}

impl EventBus {
    pub fn new(buffer_size: usize, recycler: Arc<Recycler>) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size,
            closed: AtomicBool::new(false),
            bus_shutdown: Shutdown::new(),
            recycler,
        })
    }

    /// Deliver `event` to every subscriber of its kind as an independent
    /// pool clone.
    ///
    /// Returns `Unavailable` when the bus is closed or at least one
    /// subscriber buffer was full (those deliveries are dropped; the rest
    /// still went through). A subscriber whose channel is already gone is
    /// skipped silently.
    pub fn publish(&self, event: &Event) -> Result<(), CoreError> {
        if event.kind == EventKind::Unspecified {
            return Err(CoreError::Invalid("event without kind".to_string()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Unavailable("bus closed".to_string()));
        }

        // Snapshot the senders so a concurrent unsubscribe cannot mutate
        // the vector under the delivery loop.
        let senders: Vec<(SubscriptionId, mpsc::Sender<Box<Event>>)> = match self
            .subscribers
            .get(&event.kind)
        {
            Some(entries) => entries.iter().map(|e| (e.id, e.tx.clone())).collect(),
            None => return Ok(()),
        };

        let mut full_drops = 0usize;
        for (id, tx) in senders {
            let mut clone = self.recycler.checkout_event();
            clone.copy_from(event);
            match tx.try_send(clone) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(clone)) => {
                    full_drops += 1;
                    self.recycler.recycle_event(clone);
                    tracing::warn!(
                        subscription = id,
                        kind = ?event.kind,
                        provider = %event.provider,
                        symbol = %event.symbol,
                        "subscriber buffer full, delivery dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(clone)) => {
                    // subscriber already cancelled: silent discard
                    self.recycler.recycle_event(clone);
                }
            }
        }

        if full_drops > 0 {
            return Err(CoreError::Unavailable(format!(
                "{full_drops} subscriber buffer(s) full"
            )));
        }
        Ok(())
    }

    /// Register a subscriber for one kind. The receiver yields pooled
    /// events the subscriber must recycle.
    pub fn subscribe(
        &self,
        kind: EventKind,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Box<Event>>), CoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Unavailable("bus closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        self.subscribers
            .entry(kind)
            .or_default()
            .push(SubscriberEntry { id, tx });
        self.by_id.insert(id, kind);

        tracing::debug!(subscription = id, ?kind, "subscriber registered");
        Ok((id, rx))
    }

    /// Like [`EventBus::subscribe`], additionally tying the subscription's
    /// lifetime to the given shutdown signal: when it (or the bus) fires,
    /// an observer task unsubscribes and the channel closes.
    pub fn subscribe_with_shutdown(
        self: Arc<Self>,
        kind: EventKind,
        shutdown: Shutdown,
    ) -> Result<(SubscriptionId, mpsc::Receiver<Box<Event>>), CoreError> {
        let (id, rx) = self.subscribe(kind)?;

        let bus_shutdown = self.bus_shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = bus_shutdown.cancelled() => {}
            }
            self.unsubscribe(id);
        });

        Ok((id, rx))
    }

    /// Idempotent removal. Dropping the stored sender closes the channel;
    /// a second call for the same id is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let Some((_, kind)) = self.by_id.remove(&id) else {
            return;
        };
        if let Some(mut entries) = self.subscribers.get_mut(&kind) {
            entries.retain(|e| e.id != id);
        }
        tracing::debug!(subscription = id, ?kind, "subscriber removed");
    }

    /// Close the bus: reject future publishes/subscribes and close every
    /// subscriber channel exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bus_shutdown.request_shutdown();
        self.by_id.clear();
        // Dropping the senders closes each channel.
        self.subscribers.clear();
        tracing::info!("event bus closed");
    }

    /// Active subscriptions for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, |e| e.len())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer_size", &self.buffer_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("subscriptions", &self.by_id.len())
            .finish()
    }
}
