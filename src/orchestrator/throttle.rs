//! Per-instrument emission throttle
//!
//! Caps how often a fused record is emitted per instrument. Events that
//! lose the race are dropped, never re-queued; the next passing event
//! carries the freshest state anyway.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::clock::Clock;

#[derive(Debug)]
pub struct EmitThrottle {
    last_emit: DashMap<String, Instant>,
    interval: Duration,
    clock: Clock,
}

impl EmitThrottle {
    pub fn new(interval: Duration, clock: Clock) -> Self {
        Self {
            last_emit: DashMap::new(),
            interval,
            clock,
        }
    }

    /// True when the instrument may emit now; records the emission time.
    /// A zero interval always allows.
    pub fn allow(&self, instrument: &str) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        let now = self.clock.now();
        let mut allowed = false;
        self.last_emit
            .entry(instrument.to_string())
            .and_modify(|last| {
                if now.duration_since(*last) >= self.interval {
                    *last = now;
                    allowed = true;
                }
            })
            .or_insert_with(|| {
                allowed = true;
                now
            });
        allowed
    }
}
