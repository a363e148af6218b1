//! Dispatch table - the control-plane-owned routing state
//!
//! Maps a canonical type to the venue route that produces it, plus the
//! field filters an incoming raw instance must pass. Every mutation bumps
//! the table version atomically; the ingestor stamps the current version
//! onto each event it emits and the orchestrator's stamper propagates it
//! downstream. The HTTP surface that drives upsert/remove lives outside
//! this crate; only the mutation contract is here.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::TableVersion;
use crate::ingest::RawInstance;

// ============================================================
// FILTER RULES
// ============================================================

/// Filter operator over raw string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// Field equals the single value.
    Eq,
    /// Field is one of the listed values.
    In,
}

/// One field/op/value rule. Rules on a route are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl FilterRule {
    /// Evaluate against a raw instance. A missing field fails the rule.
    pub fn matches(&self, raw: &RawInstance) -> bool {
        let Some(actual) = raw.field_as_str(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => self.values.first().is_some_and(|v| v == &actual),
            FilterOp::In => self.values.iter().any(|v| v == &actual),
        }
    }
}

// ============================================================
// ROUTE ENTRIES
// ============================================================

/// Route for one canonical type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub canonical_type: String,
    pub provider: String,
    #[serde(default)]
    pub ws_topics: Vec<String>,
    #[serde(default)]
    pub rest_fns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
}

impl RouteEntry {
    /// AND over all filter rules; a route without rules accepts everything.
    pub fn accepts(&self, raw: &RawInstance) -> bool {
        self.filters.iter().all(|rule| rule.matches(raw))
    }
}

// ============================================================
// DISPATCH TABLE
// ============================================================

/// Concurrent route registry with a monotone version counter.
#[derive(Debug, Default)]
pub struct DispatchTable {
    routes: DashMap<String, RouteEntry>,
    version: AtomicU64,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for its canonical type. Returns the new
    /// table version.
    pub fn upsert(&self, route: RouteEntry) -> TableVersion {
        self.routes.insert(route.canonical_type.clone(), route);
        self.bump()
    }

    /// Remove the route for a canonical type. Bumps the version even when
    /// the route was absent - the control plane treats every mutation call
    /// as a generation flip.
    pub fn remove(&self, canonical_type: &str) -> TableVersion {
        self.routes.remove(canonical_type);
        self.bump()
    }

    pub fn get(&self, canonical_type: &str) -> Option<RouteEntry> {
        self.routes.get(canonical_type).map(|r| r.clone())
    }

    pub fn version(&self) -> TableVersion {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn bump(&self) -> TableVersion {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

// ============================================================
// CONTROL-PLANE HOOK
// ============================================================

use crate::consumer::ConsumerRegistry;
use crate::orchestrator::stamp::VersionStamper;
use std::sync::Arc;

/// The control plane's mutation surface. An external controller (HTTP or
/// otherwise, out of scope here) calls these; each table mutation bumps
/// the generation and propagates it to the stamper and, on upserts, to
/// every consumer's minimum routing version so stale market data gets
/// filtered after the flip.
#[derive(Debug)]
pub struct ControlPlane {
    table: Arc<DispatchTable>,
    stamper: Arc<VersionStamper>,
    consumers: Arc<ConsumerRegistry>,
}

impl ControlPlane {
    pub fn new(
        table: Arc<DispatchTable>,
        stamper: Arc<VersionStamper>,
        consumers: Arc<ConsumerRegistry>,
    ) -> Self {
        Self {
            table,
            stamper,
            consumers,
        }
    }

    /// Install or replace a route. Consumers advance their filter floor to
    /// the new generation.
    pub fn table_upsert(&self, route: RouteEntry) -> TableVersion {
        let version = self.table.upsert(route);
        self.stamper.update_version(version);
        self.consumers.update_all_min_versions(version);
        tracing::info!(version, "dispatch table upserted");
        version
    }

    /// Remove a route. The stamper follows the new generation; consumer
    /// floors stay put (removal produces no fresher data to wait for).
    pub fn table_remove(&self, canonical_type: &str) -> TableVersion {
        let version = self.table.remove(canonical_type);
        self.stamper.update_version(version);
        tracing::info!(version, canonical_type, "dispatch table route removed");
        version
    }

    pub fn version(&self) -> TableVersion {
        self.table.version()
    }
}
