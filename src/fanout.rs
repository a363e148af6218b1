//! Fan-out engine - one logical event to N subscribers
//!
//! The first subscriber works on the original instance; every further
//! subscriber gets a pool clone. Deliveries run concurrently, bounded by
//! `max_parallelism`; a panicking subscriber is captured into a synthetic
//! error and never takes the runtime down. Once every delivery has
//! settled, all instances (original + clones) go back to the pool.
//!
//! Ordering across subscribers is deliberately undefined; within one
//! subscriber, deliveries are FIFO because dispatch calls are awaited
//! sequentially by the caller. Tests that need a deterministic schedule
//! set `max_parallelism = 1`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::FanoutConfig;
use crate::error::{AggregateError, CoreError, SubscriberFailure, panic_text};
use crate::event::Event;
use crate::pool::Recycler;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;

/// A fan-out delivery target.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Handle one event. The instance is owned by the engine for the
    /// duration of the call and recycled afterwards regardless of outcome.
    async fn on_event(&self, event: &Event) -> Result<(), CoreError>;
}

/// Bounded-parallelism dispatcher over a subscriber set.
#[derive(Debug)]
pub struct FanoutEngine {
    max_parallelism: usize,
    recycler: Arc<Recycler>,
    stats: Arc<PipelineStats>,
}

impl FanoutEngine {
    pub fn new(config: &FanoutConfig, recycler: Arc<Recycler>, stats: Arc<PipelineStats>) -> Self {
        Self {
            max_parallelism: config.max_parallelism.max(1),
            recycler,
            stats,
        }
    }

    /// Deliver `event` to every subscriber.
    ///
    /// All failures (errors, panics, cancellation) are joined into one
    /// [`AggregateError`]. The original and every clone are recycled
    /// exactly once before this returns.
    pub async fn dispatch(
        &self,
        event: Box<Event>,
        subscribers: &[Arc<dyn Subscriber>],
        shutdown: &Shutdown,
    ) -> Result<(), CoreError> {
        PipelineStats::incr(&self.stats.fanout_dispatches);

        if subscribers.is_empty() {
            self.recycler.recycle_event(event);
            return Ok(());
        }

        // Labels for the aggregate error, captured before the instance
        // moves into its delivery task.
        let trace_id = event.trace_id.clone();
        let event_kind = event.kind;
        let routing_version = event.routing_version;

        // First subscriber takes the original; the rest get clones.
        let mut instances = Vec::with_capacity(subscribers.len());
        for _ in 1..subscribers.len() {
            let mut clone = self.recycler.checkout_event();
            clone.copy_from(&event);
            instances.push(clone);
        }
        instances.insert(0, event);

        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let started = Instant::now();
        let mut join_set = JoinSet::new();

        for (idx, (subscriber, instance)) in
            subscribers.iter().zip(instances.into_iter()).enumerate()
        {
            let subscriber = Arc::clone(subscriber);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("dispatch semaphore never closed");
                let delivery_started = Instant::now();
                let outcome = tokio::select! {
                    caught = AssertUnwindSafe(subscriber.on_event(&instance)).catch_unwind() => {
                        match caught {
                            Ok(result) => result,
                            Err(panic) => Err(CoreError::Panic(format!(
                                "{}\n{}",
                                panic_text(panic.as_ref()),
                                std::backtrace::Backtrace::force_capture(),
                            ))),
                        }
                    }
                    _ = shutdown.cancelled() => Err(CoreError::Canceled),
                };
                (idx, instance, outcome, delivery_started.elapsed())
            });
        }

        let mut failures: Vec<(usize, SubscriberFailure)> = Vec::new();
        let mut busy = Duration::ZERO;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, instance, outcome, elapsed)) => {
                    busy += elapsed;
                    tracing::trace!(
                        subscriber = subscribers[idx].id(),
                        duration_us = elapsed.as_micros() as u64,
                        "delivery settled"
                    );
                    self.recycler.recycle_event(instance);
                    if let Err(error) = outcome {
                        failures.push((
                            idx,
                            SubscriberFailure {
                                subscriber_id: subscribers[idx].id().to_string(),
                                error,
                            },
                        ));
                    }
                }
                Err(join_error) => {
                    // Only reachable if a delivery task itself dies; the
                    // instance it held is gone with it.
                    failures.push((
                        usize::MAX,
                        SubscriberFailure {
                            subscriber_id: "<join>".to_string(),
                            error: CoreError::Panic(join_error.to_string()),
                        },
                    ));
                }
            }
        }

        let total = started.elapsed();
        let n = subscribers.len() as f64;
        let efficiency =
            (busy.as_secs_f64() / (n * total.as_secs_f64().max(f64::EPSILON))).min(1.0);
        tracing::debug!(
            subscribers = subscribers.len(),
            total_us = total.as_micros() as u64,
            busy_us = busy.as_micros() as u64,
            parallel_efficiency = efficiency,
            "fanout dispatch complete"
        );

        if failures.is_empty() {
            return Ok(());
        }

        PipelineStats::add(&self.stats.fanout_failures, failures.len() as u64);
        failures.sort_by_key(|(idx, _)| *idx);
        Err(CoreError::Aggregated(AggregateError {
            operation: "fanout.dispatch",
            trace_id,
            event_kind,
            routing_version,
            failures: failures.into_iter().map(|(_, f)| f).collect(),
        }))
    }
}
