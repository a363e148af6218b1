//! Consumer wrapper + registry - the per-subscriber invocation harness
//!
//! Wraps user callback code with the routing-version filter, panic
//! capture, per-consumer counters, and a guaranteed return of the event to
//! the pool on every path (processed, filtered, error, panic).
//!
//! Market-data events produced under an older dispatch-table generation
//! than the consumer's minimum are filtered out; critical kinds
//! (ExecReport, ControlAck, ControlResult, RiskControl) are always
//! delivered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;

use crate::core_types::RoutingVersion;
use crate::error::{CoreError, panic_text};
use crate::event::Event;
use crate::pool::Recycler;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;

// ============================================================
// CONSUMER WRAPPER
// ============================================================

/// Per-consumer counters, point-in-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerCounters {
    pub processed: u64,
    pub filtered: u64,
    pub panics: u64,
}

/// Invocation harness for one registered consumer.
#[derive(Debug)]
pub struct ConsumerWrapper {
    id: String,
    min_version: AtomicU64,
    recycler: Arc<Recycler>,
    stats: Arc<PipelineStats>,
    processed: AtomicU64,
    filtered: AtomicU64,
    panics: AtomicU64,
}

impl ConsumerWrapper {
    pub fn new(id: impl Into<String>, recycler: Arc<Recycler>, stats: Arc<PipelineStats>) -> Self {
        Self {
            id: id.into(),
            min_version: AtomicU64::new(0),
            recycler,
            stats,
            processed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the minimum routing version below which market-data events are
    /// filtered. The control plane is the sole writer.
    pub fn update_min_version(&self, version: RoutingVersion) {
        self.min_version.store(version, Ordering::Release);
    }

    pub fn min_version(&self) -> RoutingVersion {
        self.min_version.load(Ordering::Acquire)
    }

    /// Critical kinds always process; everything else must carry a
    /// routing version at or above the consumer's minimum.
    pub fn should_process(&self, event: &Event) -> bool {
        event.kind.is_critical() || event.routing_version >= self.min_version()
    }

    /// Run `f` over the event if it passes the filter. The event goes back
    /// to the pool on every path; a panicking callback is captured into a
    /// `Panic` error and counted.
    pub async fn invoke<F, Fut>(&self, event: Box<Event>, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&Event) -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        if !self.should_process(&event) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            PipelineStats::incr(&self.stats.consumer_filtered);
            tracing::trace!(
                consumer = %self.id,
                kind = ?event.kind,
                routing_version = event.routing_version,
                min_version = self.min_version(),
                "event filtered by routing version"
            );
            self.recycler.recycle_event(event);
            return Ok(());
        }

        let caught = AssertUnwindSafe(f(&event)).catch_unwind().await;
        self.recycler.recycle_event(event);

        match caught {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                PipelineStats::incr(&self.stats.consumer_processed);
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(panic) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                PipelineStats::incr(&self.stats.consumer_panics);
                let error = CoreError::Panic(format!(
                    "{}\n{}",
                    panic_text(panic.as_ref()),
                    std::backtrace::Backtrace::force_capture(),
                ));
                tracing::error!(consumer = %self.id, %error, "consumer panicked");
                Err(error)
            }
        }
    }

    pub fn counters(&self) -> ConsumerCounters {
        ConsumerCounters {
            processed: self.processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }

    /// Drive a bus subscription through this wrapper until the channel
    /// closes or shutdown fires. Each received event is filtered, handed
    /// to `f`, and recycled; callback errors are logged and do not stop
    /// the loop.
    pub async fn run<F, Fut>(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<Box<Event>>,
        shutdown: Shutdown,
        f: F,
    ) where
        F: Fn(&Event) -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if let Err(error) = self.invoke(event, &f).await {
                tracing::warn!(consumer = %self.id, %error, "consumer callback failed");
            }
        }
        // Drain whatever is still buffered so nothing leaks from the pool.
        while let Ok(event) = rx.try_recv() {
            self.recycler.recycle_event(event);
        }
        tracing::debug!(consumer = %self.id, "consumer loop stopped");
    }
}

// ============================================================
// REGISTRY
// ============================================================

/// Registered consumer wrappers, addressable by id.
#[derive(Debug)]
pub struct ConsumerRegistry {
    consumers: DashMap<String, Arc<ConsumerWrapper>>,
    recycler: Arc<Recycler>,
}

impl ConsumerRegistry {
    pub fn new(recycler: Arc<Recycler>) -> Self {
        Self {
            consumers: DashMap::new(),
            recycler,
        }
    }

    pub fn register(&self, wrapper: Arc<ConsumerWrapper>) {
        self.consumers.insert(wrapper.id().to_string(), wrapper);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConsumerWrapper>> {
        self.consumers.get(id).map(|w| Arc::clone(&w))
    }

    pub fn remove(&self, id: &str) {
        self.consumers.remove(id);
    }

    /// Delegate to a registered wrapper. An unknown id is an error; the
    /// event still goes back to the pool.
    pub async fn invoke<F, Fut>(
        &self,
        id: &str,
        event: Box<Event>,
        f: F,
    ) -> Result<(), CoreError>
    where
        F: FnOnce(&Event) -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        let Some(wrapper) = self.get(id) else {
            self.recycler.recycle_event(event);
            return Err(CoreError::NotFound(format!("consumer {id:?}")));
        };
        wrapper.invoke(event, f).await
    }

    /// Push a new minimum routing version to every registered consumer,
    /// the control plane's broadcast on a table flip.
    pub fn update_all_min_versions(&self, version: RoutingVersion) {
        for wrapper in self.consumers.iter() {
            wrapper.update_min_version(version);
        }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::event::{EventKind, Payload, TradeData};

    struct Fixture {
        recycler: Arc<Recycler>,
        stats: Arc<PipelineStats>,
    }

    fn fixture() -> Fixture {
        Fixture {
            recycler: Recycler::new(&PoolConfig {
                max_cached: 32,
                debug_checks: true,
            }),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    fn wrapper(fx: &Fixture, id: &str) -> ConsumerWrapper {
        ConsumerWrapper::new(id, Arc::clone(&fx.recycler), Arc::clone(&fx.stats))
    }

    fn event(fx: &Fixture, kind: EventKind, routing_version: u64) -> Box<Event> {
        let mut event = fx.recycler.checkout_event();
        event.kind = kind;
        event.routing_version = routing_version;
        if kind == EventKind::Trade {
            event.payload = Payload::Trade(TradeData::default());
        }
        event
    }

    #[tokio::test]
    async fn test_stale_market_data_filtered() {
        let fx = fixture();
        let consumer = wrapper(&fx, "grid-1");
        consumer.update_min_version(100);

        let stale = event(&fx, EventKind::BookSnapshot, 50);
        let result = consumer
            .invoke(stale, |_| async { panic!("must not run") })
            .await;
        assert!(result.is_ok());

        let counters = consumer.counters();
        assert_eq!(counters.filtered, 1);
        assert_eq!(counters.processed, 0);
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_critical_kind_bypasses_filter() {
        let fx = fixture();
        let consumer = wrapper(&fx, "grid-1");
        consumer.update_min_version(100);

        let report = event(&fx, EventKind::ExecReport, 50);
        let result = consumer.invoke(report, |_| async { Ok(()) }).await;
        assert!(result.is_ok());

        let counters = consumer.counters();
        assert_eq!(counters.processed, 1);
        assert_eq!(counters.filtered, 0);
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fresh_market_data_processed() {
        let fx = fixture();
        let consumer = wrapper(&fx, "grid-1");
        consumer.update_min_version(100);

        let fresh = event(&fx, EventKind::Trade, 100);
        assert!(consumer.invoke(fresh, |_| async { Ok(()) }).await.is_ok());
        assert_eq!(consumer.counters().processed, 1);
    }

    #[tokio::test]
    async fn test_panic_captured_and_event_recycled() {
        let fx = fixture();
        let consumer = wrapper(&fx, "momentum-1");

        let ev = event(&fx, EventKind::Trade, 0);
        let err = consumer
            .invoke(ev, |_| async { panic!("strategy bug") })
            .await
            .unwrap_err();

        let CoreError::Panic(detail) = &err else {
            panic!("expected panic error, got {err:?}");
        };
        assert!(detail.contains("strategy bug"));
        assert!(err.to_string().starts_with("consumer panic:"));
        assert_eq!(consumer.counters().panics, 1);
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_propagates_event_recycled() {
        let fx = fixture();
        let consumer = wrapper(&fx, "mm-1");

        let ev = event(&fx, EventKind::Trade, 0);
        let err = consumer
            .invoke(ev, |_| async { Err(CoreError::Unavailable("venue down".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
        assert_eq!(fx.recycler.outstanding(), 0);
        // an error is not a processed event
        assert_eq!(consumer.counters().processed, 0);
    }

    #[tokio::test]
    async fn test_version_read_back() {
        let fx = fixture();
        let consumer = wrapper(&fx, "grid-1");
        consumer.update_min_version(7);
        assert_eq!(consumer.min_version(), 7);
    }

    #[tokio::test]
    async fn test_registry_routes_by_id() {
        let fx = fixture();
        let registry = ConsumerRegistry::new(Arc::clone(&fx.recycler));
        registry.register(Arc::new(wrapper(&fx, "grid-1")));

        let ev = event(&fx, EventKind::Trade, 0);
        assert!(registry.invoke("grid-1", ev, |_| async { Ok(()) }).await.is_ok());

        let ev = event(&fx, EventKind::Trade, 0);
        let err = registry
            .invoke("ghost", ev, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        // unknown-id events are recycled too
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_registry_broadcasts_min_version() {
        let fx = fixture();
        let registry = ConsumerRegistry::new(Arc::clone(&fx.recycler));
        let a = Arc::new(wrapper(&fx, "a"));
        let b = Arc::new(wrapper(&fx, "b"));
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        registry.update_all_min_versions(42);
        assert_eq!(a.min_version(), 42);
        assert_eq!(b.min_version(), 42);
    }
}
