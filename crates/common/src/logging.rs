// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0

//! Logging configuration for tracefork components
//!
//! Provides centralized logging setup with:
//! - Structured console output with timestamps and source locations
//! - Optional daily-rolling file logging in the system temp directory
//! - Environment variable support (RUST_LOG), INFO by default
//! - An idempotent initializer for tests

use eyre::Result;
use std::{env, fs, path::PathBuf, sync::Once};
use tracing::Level;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Directory under the system temp folder that holds component log files
const LOG_ROOT: &str = "tracefork-logs";

/// Crates whose debug output drowns the replay logs on the console
const NOISY_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "tungstenite", "tokio_tungstenite"];

/// Initialize logging for a tracefork component
///
/// Sets up a console layer and, when `enable_file_logging` is true, a file layer
/// rotating daily under `$TMPDIR/tracefork-logs/<component>/`. The level comes
/// from `RUST_LOG` and defaults to INFO.
///
/// # Arguments
/// * `component_name` - Name of the component (e.g., "tracefork")
/// * `enable_file_logging` - Whether to also write logs to disk
///
/// # Examples
/// ```rust,no_run
/// use tracefork_common::logging;
///
/// fn main() -> eyre::Result<()> {
///     logging::init_logging("tracefork", true)?;
///     tracing::info!("Application started");
///     Ok(())
/// }
/// ```
pub fn init_logging(component_name: &str, enable_file_logging: bool) -> Result<()> {
    init_logging_at(component_name, enable_file_logging, Level::INFO)
}

/// Like [`init_logging`], with `level` used when `RUST_LOG` is unset
pub fn init_logging_at(component_name: &str, enable_file_logging: bool, level: Level) -> Result<()> {
    let env_filter = default_filter(level)?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true)
        .with_writer(std::io::stderr);

    if enable_file_logging {
        let log_dir = create_log_directory(component_name)?;

        let file_appender = rolling::daily(&log_dir, format!("{component_name}.log"));
        let (non_blocking_appender, guard) = non_blocking(file_appender);

        // The guard flushes on drop; logging lives for the whole process.
        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(non_blocking_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_filter(filter_for_console(level)))
            .with(file_layer.with_filter(filter_for_file(level)))
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {e}"))?;

        tracing::info!(
            component = component_name,
            log_dir = %log_dir.display(),
            "Logging initialized with console and file output"
        );
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_filter(filter_for_console(level)))
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {e}"))?;

        tracing::info!(component = component_name, "Logging initialized with console output only");
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing::debug!(component = component_name, rust_log = %rust_log, "Environment information");

    Ok(())
}

/// Build the `RUST_LOG` filter, falling back to `level` when unset or invalid
fn default_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .map_err(|e| eyre::eyre!("Failed to create environment filter: {e}"))
}

/// Create log directory in system temp folder
fn create_log_directory(component_name: &str) -> Result<PathBuf> {
    let log_dir = env::temp_dir().join(LOG_ROOT).join(component_name);
    fs::create_dir_all(&log_dir)?;
    Ok(log_dir)
}

/// Filter for console output, quieting transport crates
fn filter_for_console(level: Level) -> EnvFilter {
    let base = default_filter(level).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    NOISY_CRATES.iter().fold(base, |filter, krate| {
        match format!("{krate}=warn").parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    })
}

/// Filter for file output, as verbose as RUST_LOG allows
fn filter_for_file(level: Level) -> EnvFilter {
    default_filter(level).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Initialize simple logging (console only, compact formatting)
///
/// Useful for tests and one-shot utilities.
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(level)?)
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize simple logging: {e}"))?;

    Ok(())
}

static TEST_LOGGING_INIT: Once = Once::new();

/// Safe logging initialization for tests, callable any number of times
///
/// The first call installs a compact console subscriber (INFO unless
/// `default_level` or `RUST_LOG` says otherwise); later calls are no-ops.
///
/// # Usage
/// ```rust
/// use tracefork_common::logging;
///
/// logging::ensure_test_logging(None);
/// tracing::info!("safe in any test");
/// ```
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING_INIT.call_once(|| {
        // A subscriber installed elsewhere is fine for tests.
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_logging_functions_work() {
        ensure_test_logging(None);

        info!("Test info message");
        warn!("Test warning message");
        debug!("Test debug message");
    }

    #[test]
    fn test_log_directory_creation() {
        let log_dir = create_log_directory("test-component").unwrap();
        assert!(log_dir.exists());
        assert!(log_dir.to_string_lossy().contains(LOG_ROOT));
        assert!(log_dir.to_string_lossy().contains("test-component"));
    }

    #[test]
    fn test_console_filter_quiets_transport_crates() {
        let rendered = filter_for_console(Level::INFO).to_string();
        assert!(rendered.contains("reqwest=warn"));
        assert!(rendered.contains("tungstenite=warn"));
    }

    #[test]
    fn test_repeated_initialization_is_harmless() {
        ensure_test_logging(None);

        // Both calls may fail because a subscriber already exists; neither may panic.
        let _ = init_logging("test-repeat-1", false);
        let _ = init_logging("test-repeat-2", false);

        info!("Still logging after repeated init attempts");
    }
}
