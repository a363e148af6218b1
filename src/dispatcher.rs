//! Dispatcher runtime - the loop between canonical producers and the bus
//!
//! Consumes canonical events, drops duplicates by event id inside a
//! time+capacity bounded window, feeds the per-stream ordering buffer, and
//! publishes released events to the bus. A periodic tick flushes streams
//! whose lateness tolerance has lapsed. Per-event failures go out on a
//! bounded best-effort error channel; only input closure or shutdown stops
//! the loop, which then drains the ordering buffer and publishes the
//! remainder.
//!
//! ```text
//!            ┌──────────────── dispatcher runtime ────────────────┐
//! canonical  │  dedup (event_id, window)  →  ordering buffer  →   │  bus
//! events ──▶ │        50ms flush tick ──────────┘                 │ ──▶
//!            └────────────────────────────────────────────────────┘
//! ```

use std::time::Instant;

use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::{DispatcherConfig, OrderingConfig};
use crate::error::CoreError;
use crate::event::Event;
use crate::ordering::OrderingBuffer;
use crate::pool::Recycler;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;

/// The runtime's single-loop state. The dedup map is owned by the loop
/// task; nothing else touches it.
pub struct DispatcherRuntime {
    config: DispatcherConfig,
    ordering: OrderingBuffer,
    bus: Arc<EventBus>,
    recycler: Arc<Recycler>,
    stats: Arc<PipelineStats>,
    clock: Clock,
    flush_interval: std::time::Duration,
    seen: FxHashMap<String, Instant>,
}

impl DispatcherRuntime {
    pub fn new(
        config: DispatcherConfig,
        ordering_config: &OrderingConfig,
        clock: Clock,
        bus: Arc<EventBus>,
        recycler: Arc<Recycler>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let ordering = OrderingBuffer::new(
            ordering_config,
            clock.clone(),
            Arc::clone(&recycler),
            Arc::clone(&stats),
        );
        Self {
            config,
            ordering,
            bus,
            recycler,
            stats,
            clock,
            flush_interval: ordering_config.flush_interval(),
            seen: FxHashMap::default(),
        }
    }

    /// Spawn the runtime loop. The returned channel carries non-fatal
    /// per-event errors, best effort: when it is full, errors are dropped
    /// on the floor rather than blocking the hot path.
    pub fn start(
        self,
        events_rx: mpsc::Receiver<Box<Event>>,
        shutdown: Shutdown,
    ) -> mpsc::Receiver<CoreError> {
        let (err_tx, err_rx) = mpsc::channel(self.config.error_channel_capacity.max(1));
        tokio::spawn(self.run(events_rx, err_tx, shutdown));
        err_rx
    }

    /// The loop body. Public for callers that want to drive it on a
    /// runtime of their choice instead of detaching via [`Self::start`].
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<Box<Event>>,
        err_tx: mpsc::Sender<CoreError>,
        shutdown: Shutdown,
    ) {
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            dedup_window_ms = self.config.dedup_window_ms,
            dedup_capacity = self.config.dedup_capacity,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "dispatcher runtime started"
        );

        loop {
            tokio::select! {
                maybe_event = events_rx.recv() => match maybe_event {
                    Some(event) => self.handle_event(event, &err_tx),
                    None => break,
                },
                _ = tick.tick() => self.handle_flush(&err_tx),
                _ = shutdown.cancelled() => break,
            }
        }

        // Terminal flush: everything still buffered goes out best-effort,
        // and undelivered input goes straight back to the pool.
        for event in self.ordering.drain() {
            self.publish_and_release(event, &err_tx);
        }
        while let Ok(event) = events_rx.try_recv() {
            self.recycler.recycle_event(event);
        }
        tracing::info!("dispatcher runtime stopped");
    }

    /// Dedup, then feed the ordering buffer and publish whatever it
    /// releases.
    fn handle_event(&mut self, event: Box<Event>, err_tx: &mpsc::Sender<CoreError>) {
        // Events without an id skip deduplication entirely.
        if !event.event_id.is_empty() && self.is_duplicate(&event) {
            PipelineStats::incr(&self.stats.deduped);
            self.recycler.recycle_event(event);
            return;
        }

        let (ready, _buffered) = self.ordering.on_event(event);
        for released in ready {
            self.publish_and_release(released, err_tx);
        }
    }

    /// Flush tick: release streams whose tolerance has lapsed.
    fn handle_flush(&mut self, err_tx: &mpsc::Sender<CoreError>) {
        for event in self.ordering.flush() {
            self.publish_and_release(event, err_tx);
        }
    }

    /// Window-bounded duplicate check; records first sightings and
    /// refreshes entries that fall outside the window. The map is pruned
    /// in one pass when it outgrows its capacity.
    fn is_duplicate(&mut self, event: &Event) -> bool {
        let now = self.clock.now();
        let window = self.config.dedup_window();

        if let Some(first_seen) = self.seen.get(&event.event_id) {
            if now.duration_since(*first_seen) <= window {
                return true;
            }
        }
        self.seen.insert(event.event_id.clone(), now);

        if self.seen.len() > self.config.dedup_capacity {
            let before = self.seen.len();
            self.seen
                .retain(|_, seen_at| now.duration_since(*seen_at) <= window);
            tracing::debug!(
                pruned = before - self.seen.len(),
                remaining = self.seen.len(),
                "dedup map pruned"
            );
        }
        false
    }

    /// Default the provider, publish (the bus clones per subscriber), then
    /// return the instance to the pool. Publish errors are non-fatal.
    fn publish_and_release(&self, mut event: Box<Event>, err_tx: &mpsc::Sender<CoreError>) {
        if event.provider.is_empty() {
            event.provider = self.config.default_provider.clone();
        }

        match self.bus.publish(&event) {
            Ok(()) => PipelineStats::incr(&self.stats.published),
            Err(error) => {
                PipelineStats::incr(&self.stats.publish_errors);
                tracing::warn!(
                    trace_id = event.trace_id.as_deref().unwrap_or(""),
                    event_kind = ?event.kind,
                    routing_version = event.routing_version,
                    provider = %event.provider,
                    symbol = %event.symbol,
                    %error,
                    "bus publish failed"
                );
                // best effort: a full error channel drops the report
                let _ = err_tx.try_send(error);
            }
        }
        self.recycler.recycle_event(event);
    }

    /// Ordering-buffer depth across all streams, for observability.
    pub fn buffered_depth(&self) -> usize {
        self.ordering.total_depth()
    }
}

impl std::fmt::Debug for DispatcherRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRuntime")
            .field("dedup_entries", &self.seen.len())
            .field("buffered", &self.ordering.total_depth())
            .finish()
    }
}
