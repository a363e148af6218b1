//! Routing-version stamper
//!
//! Holds the current routing version as an atomic. The control plane is
//! the sole writer; every event the orchestrator emits downstream gets
//! stamped with the value current at emission time, which is what lets
//! consumers filter market data produced under a superseded table.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core_types::RoutingVersion;
use crate::event::Event;

#[derive(Debug, Default)]
pub struct VersionStamper {
    current: AtomicU64,
}

impl VersionStamper {
    pub fn new(initial: RoutingVersion) -> Self {
        Self {
            current: AtomicU64::new(initial),
        }
    }

    /// Unconditional set; single-writer by contract.
    pub fn update_version(&self, version: RoutingVersion) {
        self.current.store(version, Ordering::Release);
    }

    pub fn current_version(&self) -> RoutingVersion {
        self.current.load(Ordering::Acquire)
    }

    pub fn stamp(&self, event: &mut Event) {
        event.routing_version = self.current_version();
    }
}
