//! Error taxonomy surfaced by the pipeline core
//!
//! Per-event errors are never fatal to the runtime loop: they are emitted on
//! a bounded error channel, logged with structured fields, and the loop
//! continues. Pool double-free and invariant violations are the exception;
//! those are programmer errors and abort the process.

use thiserror::Error;

use crate::core_types::RoutingVersion;
use crate::event::EventKind;

/// Central error type for the pipeline core.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed input: missing canonical type / instrument, zero kind.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Snapshot or route absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// CAS version mismatch (after retries, where applicable).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bus closed or subscriber buffer full.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Fan-out composite error, carries per-subscriber sub-errors.
    #[error(transparent)]
    Aggregated(#[from] AggregateError),

    /// Subscriber panic, carries the panic payload and a backtrace rendering.
    #[error("consumer panic: {0}")]
    Panic(String),

    /// Propagated cancellation of the root shutdown signal.
    #[error("canceled")]
    Canceled,
}

impl CoreError {
    /// Stable lowercase code for metrics labels and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Aggregated(_) => "aggregated",
            Self::Panic(_) => "panic",
            Self::Canceled => "canceled",
        }
    }
}

/// A single subscriber's failure inside a fan-out dispatch.
#[derive(Debug, Clone)]
pub struct SubscriberFailure {
    pub subscriber_id: String,
    pub error: CoreError,
}

/// Composite fan-out error.
///
/// One dispatch call delivers a logical event to N subscribers; every
/// failure (error, panic, cancellation) is collected here so the caller
/// sees the full picture in one value. Labels mirror the structured log
/// fields used across the pipeline.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub operation: &'static str,
    pub trace_id: Option<String>,
    pub event_kind: EventKind,
    pub routing_version: RoutingVersion,
    pub failures: Vec<SubscriberFailure>,
}

impl AggregateError {
    /// Ids of the subscribers that failed, in delivery-start order.
    pub fn failed_subscribers(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.subscriber_id.as_str())
            .collect()
    }

    /// True if any sub-error is a cancellation.
    pub fn contains_cancellation(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.error, CoreError::Canceled))
    }
}

impl std::error::Error for AggregateError {}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} subscriber(s) failed [kind={:?} routing_version={}",
            self.operation,
            self.failures.len(),
            self.event_kind,
            self.routing_version,
        )?;
        if let Some(trace_id) = &self.trace_id {
            write!(f, " trace_id={trace_id}")?;
        }
        write!(f, "]")?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.subscriber_id, failure.error)?;
        }
        Ok(())
    }
}

/// Render a caught panic payload for [`CoreError::Panic`].
pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
