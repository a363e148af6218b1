//! Core types used throughout the pipeline
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Routing version - the generation of the dispatch table an event was
/// produced under.
///
/// # Constraints:
/// - **Monotone**: only moves forward for any fixed upstream path
/// - **Stamped**: every event downstream of the orchestrator carries one
///
/// Consumers use it to filter market data that predates a control-plane
/// table flip. Critical kinds bypass the filter.
pub type RoutingVersion = u64;

/// Per-stream sequence number, monotone per (provider, symbol, kind)
/// as assigned upstream.
pub type SeqNum = u64;

/// Dispatch table version - bumped atomically on every route upsert/remove.
pub type TableVersion = u64;

/// Subscription identifier handed out by the event bus.
pub type SubscriptionId = u64;

/// Snapshot store CAS version. Starts at 1 on first put.
pub type SnapshotVersion = u64;
