//! CAS-versioned snapshot store
//!
//! Keyed by (market, instrument, canonical_type). Readers share records;
//! writers race through compare-and-swap and exactly one wins per version
//! transition. A record whose TTL has lapsed is surfaced with a synthetic
//! `stale` marker, never as a partial payload.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::core_types::SnapshotVersion;
use crate::error::CoreError;

/// Snapshot identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub market: String,
    pub instrument: String,
    pub canonical_type: String,
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.market, self.instrument, self.canonical_type)
    }
}

/// One stored snapshot generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    /// Monotone per key, bumped on every applied delta.
    pub seq: u64,
    /// CAS counter, starts at 1 on put.
    pub version: SnapshotVersion,
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Venues whose frames were fused into this record, first
    /// contributor first.
    pub providers: Vec<String>,
    pub updated_at: DateTime<Utc>,
    /// Optional freshness bound; `None` never goes stale.
    pub ttl: Option<Duration>,
    /// Synthetic marker set on reads past the TTL. Never stored as true.
    pub stale: bool,
}

/// Concurrent snapshot store with per-entry CAS.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    records: DashMap<SnapshotKey, SnapshotRecord>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the snapshot for a key. The CAS version resets
    /// to 1; any in-flight delta against the old generation will conflict.
    pub fn put(
        &self,
        key: SnapshotKey,
        data: serde_json::Map<String, serde_json::Value>,
        source: &str,
        updated_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> SnapshotVersion {
        let record = SnapshotRecord {
            seq: 1,
            version: 1,
            data,
            providers: vec![source.to_string()],
            updated_at,
            ttl,
            stale: false,
        };
        self.records.insert(key, record);
        1
    }

    /// Read a copy of the current record. Past its TTL the copy carries
    /// `stale = true`; the payload stays whole.
    pub fn get(&self, key: &SnapshotKey) -> Result<SnapshotRecord, CoreError> {
        let record = self
            .records
            .get(key)
            .ok_or_else(|| CoreError::NotFound(format!("snapshot {key}")))?;
        let mut copy = record.clone();
        if let Some(ttl) = copy.ttl {
            let age = Utc::now().signed_duration_since(copy.updated_at);
            if age > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX) {
                copy.stale = true;
            }
        }
        Ok(copy)
    }

    /// Replace the record only if its version still equals `prev_version`.
    /// On success the stored version becomes `prev_version + 1`. Exactly
    /// one of two racing writers observes success.
    pub fn compare_and_swap(
        &self,
        key: &SnapshotKey,
        prev_version: SnapshotVersion,
        mut updated: SnapshotRecord,
    ) -> Result<SnapshotVersion, CoreError> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| CoreError::NotFound(format!("snapshot {key}")))?;
        if entry.version != prev_version {
            return Err(CoreError::Conflict(format!(
                "snapshot {key}: version is {}, caller saw {prev_version}",
                entry.version
            )));
        }
        updated.version = prev_version + 1;
        updated.stale = false;
        *entry = updated;
        Ok(entry.version)
    }

    pub fn remove(&self, key: &SnapshotKey) {
        self.records.remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
