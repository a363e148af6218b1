//! Pipeline configuration types and loaders
//!
//! All knobs for the dispatcher core live here. Defaults match the
//! production deployment; a YAML file can override any section and the
//! `MELTICA_CONFIG` environment variable points at that file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Dedup + runtime-loop knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Window within which a repeated event_id is a duplicate.
    pub dedup_window_ms: u64,
    /// Dedup map size that triggers a prune pass.
    pub dedup_capacity: usize,
    /// Capacity of the best-effort error channel returned by the runtime.
    pub error_channel_capacity: usize,
    /// Provider stamped onto events that arrive without one.
    pub default_provider: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 5 * 60 * 1000,
            dedup_capacity: 8192,
            error_channel_capacity: 256,
            default_provider: "unknown".to_string(),
        }
    }
}

impl DispatcherConfig {
    #[inline]
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Reorder-buffer knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// How long to wait for a missing sequence number before releasing
    /// its successors.
    pub lateness_tolerance_ms: u64,
    /// Periodic flush tick of the dispatcher runtime.
    pub flush_interval_ms: u64,
    /// Per-stream buffer size that forces release of the oldest entry.
    pub max_buffer_size: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            lateness_tolerance_ms: 150,
            flush_interval_ms: 50,
            max_buffer_size: 64,
        }
    }
}

impl OrderingConfig {
    #[inline]
    pub fn lateness_tolerance(&self) -> Duration {
        Duration::from_millis(self.lateness_tolerance_ms)
    }

    #[inline]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Event-bus knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bounded buffer per subscription; a full buffer drops the delivery.
    pub buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

/// Fan-out engine knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Concurrent subscriber deliveries per dispatch call.
    pub max_parallelism: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 16,
        }
    }
}

/// Orchestrator knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum spacing between fused emissions per instrument.
    /// Zero means no throttling.
    pub emit_interval_ms: u64,
    /// CAS attempts per delta before giving up.
    pub cas_retry_limit: u32,
    /// Reject deltas whose timestamp is older than the stored snapshot.
    pub reject_stale_deltas: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            emit_interval_ms: 0,
            cas_retry_limit: 3,
            reject_stale_deltas: false,
        }
    }
}

impl OrchestratorConfig {
    #[inline]
    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }
}

/// Object-pool knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum instances cached per typed pool; excess returns are freed.
    pub max_cached: usize,
    /// Live-set + poison-word accounting. On by default in debug builds.
    pub debug_checks: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cached: 1024,
            debug_checks: cfg!(debug_assertions),
        }
    }
}

/// Logging initialisation knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "never", "daily" or "hourly".
    pub rotation: String,
    /// Default filter when RUST_LOG is unset, e.g. "info" or
    /// "meltica=debug,info".
    pub log_level: String,
    /// JSON file output for structured log shippers.
    pub use_json: bool,
    /// Let the per-event modules (bus, pool, synthetic feed) log at the
    /// full configured level instead of being capped at warn.
    pub verbose_hot_path: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "meltica.log".to_string(),
            rotation: "daily".to_string(),
            log_level: "info".to_string(),
            use_json: false,
            verbose_hot_path: false,
        }
    }
}

/// Complete configuration for the pipeline core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MelticaConfig {
    pub dispatcher: DispatcherConfig,
    pub ordering: OrderingConfig,
    pub bus: BusConfig,
    pub fanout: FanoutConfig,
    pub orchestrator: OrchestratorConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

impl MelticaConfig {
    /// Load from a YAML file. Missing sections fall back to defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Load from the file named by `MELTICA_CONFIG`, or defaults when the
    /// variable is unset.
    pub fn from_env_or_default() -> anyhow::Result<Self> {
        match std::env::var("MELTICA_CONFIG") {
            Ok(path) => Self::from_yaml_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}
