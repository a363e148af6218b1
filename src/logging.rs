//! Tracing initialisation for the pipeline core
//!
//! One registry, two sinks: a non-blocking rolling file (JSON for log
//! shippers or compact text) and a human-readable stdout layer. The
//! default filter keeps the per-event hot-path modules quiet so a debug
//! session does not drown in per-message lines; `RUST_LOG` overrides
//! everything.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Modules that emit a line per event or per pool operation. Held to
/// `warn` by the default filter unless `verbose_hot_path` is set.
const HOT_PATH_MODULES: [&str; 3] = ["bus", "pool", "synthetic"];

/// Initialise the global subscriber. The returned guard flushes the
/// non-blocking file writer; keep it alive for the process lifetime or
/// buffered lines are lost on exit.
pub fn init_logging(config: &LoggingConfig) -> WorkerGuard {
    let file_appender =
        RollingFileAppender::new(rotation_policy(&config.rotation), &config.log_dir, &config.log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));
    let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .init();
    }

    guard
}

/// Unknown rotation names fall back to a single unrotated file.
fn rotation_policy(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Directives used when `RUST_LOG` is unset: the configured level
/// globally, with the hot-path modules capped at `warn` unless the
/// operator asked for them.
fn default_filter(config: &LoggingConfig) -> EnvFilter {
    let mut directives = config.log_level.clone();
    if !config.verbose_hot_path {
        for module in HOT_PATH_MODULES {
            directives.push_str(&format!(",meltica::{module}=warn"));
        }
    }
    EnvFilter::new(directives)
}
