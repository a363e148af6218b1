//! Meltica - Low-Latency Aggregation Gateway Core
//!
//! The event pipeline between venue adapters and in-process strategies:
//! canonical events are deduplicated, re-ordered per stream, fanned out to
//! typed subscribers, and fused with CAS-versioned snapshot state, all on
//! pool-allocated hot-path objects.
//!
//! # Modules
//!
//! - [`core_types`] - Semantic type aliases (RoutingVersion, SeqNum, etc.)
//! - [`config`] - Pipeline configuration and YAML loader
//! - [`event`] - Canonical event, kinds, tagged payloads
//! - [`pool`] - Object pools + recycler with strict return discipline
//! - [`ordering`] - Per-stream reorder buffer with lateness tolerance
//! - [`dispatcher`] - Dedup + ordering + publish runtime loop
//! - [`fanout`] - Bounded-parallel delivery with aggregated errors
//! - [`bus`] - Typed pub/sub with bounded per-subscriber buffers
//! - [`ingest`] - Raw adapter frames to canonical events
//! - [`table`] - Dispatch table + control-plane mutation contract
//! - [`orchestrator`] - Snapshot/delta fusion, stamping, throttling
//! - [`consumer`] - Per-subscriber harness with guaranteed recycling
//! - [`synthetic`] - Seeded demo/test feed

// Core types - must be first!
pub mod core_types;

// Configuration + ambient services
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;
pub mod stats;

// Pipeline components
pub mod bus;
pub mod consumer;
pub mod dispatcher;
pub mod event;
pub mod fanout;
pub mod ingest;
pub mod ordering;
pub mod orchestrator;
pub mod pool;
pub mod synthetic;
pub mod table;

// Convenient re-exports at crate root
pub use bus::EventBus;
pub use clock::Clock;
pub use config::MelticaConfig;
pub use consumer::{ConsumerRegistry, ConsumerWrapper};
pub use core_types::{RoutingVersion, SeqNum, SnapshotVersion, SubscriptionId, TableVersion};
pub use dispatcher::DispatcherRuntime;
pub use error::{AggregateError, CoreError};
pub use event::{Event, EventKind, MergedEvent, Payload, StreamKey};
pub use fanout::{FanoutEngine, Subscriber};
pub use ingest::{Ingestor, RawInstance};
pub use ordering::OrderingBuffer;
pub use orchestrator::Orchestrator;
pub use pool::Recycler;
pub use shutdown::Shutdown;
pub use stats::PipelineStats;
pub use table::{ControlPlane, DispatchTable, RouteEntry};
