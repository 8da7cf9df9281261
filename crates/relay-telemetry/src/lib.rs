mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_hub" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Whether metrics recording is enabled.
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    /// How often to snapshot metrics to SQLite (seconds).
    pub metrics_snapshot_interval_secs: u64,
    /// How many days of metric history to retain.
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let relay_dir = relay_home();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: relay_dir.join("database/relay-logs.db"),
            metrics_enabled: true,
            metrics_db_path: relay_dir.join("database/relay-metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

impl TelemetryConfig {
    /// RUST_LOG wins; otherwise the configured default plus module
    /// overrides become the filter directives.
    fn env_filter(&self) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(
                ",{module}={}",
                level.to_string().to_lowercase()
            ));
        }
        EnvFilter::new(directives)
    }
}

/// Keeps telemetry resources alive; hold for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    _snapshot_task: Option<tokio::task::JoinHandle<()>>,
}

impl TelemetryGuard {
    /// The metrics recorder, for recording and querying.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// The log sink, for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Install the tracing subscriber (JSON fmt + optional SQLite warn+ sink)
/// and start the metrics recorder. Call once at startup from within a tokio
/// runtime; the snapshot task needs one.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(config.env_filter());

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("relay-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(log_sink.as_ref().map(|sink| SqliteLogLayer::new(Arc::clone(sink))))
        .init();

    let mut guard = TelemetryGuard {
        log_sink,
        metrics_recorder: None,
        _snapshot_task: None,
    };

    if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => {
                let recorder = Arc::new(recorder);
                guard._snapshot_task = Some(start_snapshot_task(
                    Arc::clone(&recorder),
                    Duration::from_secs(config.metrics_snapshot_interval_secs),
                    config.metrics_retention_days,
                ));
                guard.metrics_recorder = Some(recorder);
            }
            Err(e) => tracing::warn!("relay-telemetry: failed to open metrics DB: {e}"),
        }
    }

    guard
}

/// Periodically snapshot metrics to SQLite and prune expired rows.
fn start_snapshot_task(
    recorder: Arc<MetricsRecorder>,
    interval: Duration,
    retention_days: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            if let Err(e) = recorder.snapshot() {
                tracing::warn!(error = %e, "metrics snapshot failed");
            }
            if let Err(e) = recorder.prune(retention_days) {
                tracing::warn!(error = %e, "metrics prune failed");
            }
        }
    })
}

/// Root directory for relay state, `$HOME/.relay` or a /tmp fallback.
fn relay_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_under_relay_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.to_string_lossy().contains(".relay"));
        assert!(config.metrics_db_path.to_string_lossy().contains(".relay"));
        assert_eq!(config.metrics_retention_days, 7);
    }

    #[test]
    fn module_overrides_land_in_filter_directives() {
        let config = TelemetryConfig {
            module_levels: vec![("relay_hub".into(), Level::DEBUG)],
            ..Default::default()
        };
        // Only exercised when RUST_LOG is unset; the directives string is
        // still worth pinning.
        let mut directives = config.log_level.to_string().to_lowercase();
        for (module, level) in &config.module_levels {
            directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        assert_eq!(directives, "info,relay_hub=debug");
    }
}
