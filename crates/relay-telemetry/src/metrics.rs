use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One persisted metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

/// Filters for querying persisted snapshots.
#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Summary statistics over a histogram's observations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Series identity: name plus label pairs in canonical order.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        Some(serde_json::Value::Object(map).to_string())
    }
}

/// Live value of one series. Counters and gauges are lock-free; gauges keep
/// f64 bits in the atomic so they can hold fractions and negatives.
enum Series {
    Counter(AtomicU64),
    Gauge(AtomicU64),
    Histogram(Mutex<Vec<f64>>),
}

impl Series {
    fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }

    /// Value written into a snapshot row: counter total, gauge level, or
    /// histogram median.
    fn sample(&self) -> f64 {
        match self {
            Self::Counter(v) => v.load(Ordering::Relaxed) as f64,
            Self::Gauge(v) => f64::from_bits(v.load(Ordering::Relaxed)),
            Self::Histogram(obs) => summarize(&mut obs.lock()).p50,
        }
    }
}

fn summarize(obs: &mut Vec<f64>) -> HistogramSummary {
    if obs.is_empty() {
        return HistogramSummary::default();
    }
    obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let quantile = |q: f64| obs[((obs.len() as f64 * q) as usize).min(obs.len() - 1)];
    HistogramSummary {
        count: obs.len() as u64,
        sum: obs.iter().sum(),
        p50: quantile(0.50),
        p95: quantile(0.95),
        p99: quantile(0.99),
    }
}

/// In-process recorder for distribution health, with periodic SQLite
/// snapshots for history.
///
/// The hub records `relay_connections_active`, `relay_broadcast_total`,
/// `relay_broadcast_drops_total`, `relay_decode_errors_total`, and the
/// `relay_broadcast_fanout_ms` latency histogram here. The hot update path
/// touches one RwLock read and one atomic; only first use of a series takes
/// the write lock.
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Arc<Series>>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            series: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    /// Fetch or create the series for a key. A name reused with a different
    /// metric type keeps its original type; the mismatched update is dropped.
    fn series(&self, name: &str, labels: &[(&str, &str)], make: fn() -> Series) -> Arc<Series> {
        let key = SeriesKey::new(name, labels);
        if let Some(series) = self.series.read().get(&key) {
            return Arc::clone(series);
        }
        let mut map = self.series.write();
        Arc::clone(map.entry(key).or_insert_with(|| Arc::new(make())))
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let series = self.series(name, labels, || Series::Counter(AtomicU64::new(0)));
        if let Series::Counter(v) = series.as_ref() {
            v.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let series = self.series(name, labels, || Series::Gauge(AtomicU64::new(0)));
        if let Series::Gauge(v) = series.as_ref() {
            v.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let series = self.series(name, labels, || Series::Gauge(AtomicU64::new(0)));
        if let Series::Gauge(v) = series.as_ref() {
            let _ = v.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
        }
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let series = self.series(name, labels, || Series::Histogram(Mutex::new(Vec::new())));
        if let Series::Histogram(obs) = series.as_ref() {
            obs.lock().push(value);
        }
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.lookup(name, labels).as_deref() {
            Some(Series::Counter(v)) => v.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.lookup(name, labels).as_deref() {
            Some(Series::Gauge(v)) => f64::from_bits(v.load(Ordering::Relaxed)),
            _ => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.lookup(name, labels).as_deref() {
            Some(Series::Histogram(obs)) => summarize(&mut obs.lock()),
            _ => HistogramSummary::default(),
        }
    }

    fn lookup(&self, name: &str, labels: &[(&str, &str)]) -> Option<Arc<Series>> {
        self.series
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(Arc::clone)
    }

    /// Persist the current value of every live series. Returns the number of
    /// rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let live: Vec<(SeriesKey, Arc<Series>)> = self
            .series
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let db = self.db.lock();
        let mut stmt = db.prepare(
            "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (key, series) in &live {
            let kind = match series.metric_type() {
                MetricType::Counter => "counter",
                MetricType::Gauge => "gauge",
                MetricType::Histogram => "histogram",
            };
            stmt.execute(rusqlite::params![
                now,
                key.name,
                series.sample(),
                key.labels_json(),
                kind,
            ])?;
        }
        Ok(live.len())
    }

    /// Query historical snapshots, most recent first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots
             WHERE (?1 IS NULL OR name = ?1)
               AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.name, q.since, q.limit.unwrap_or(100)],
            |row| {
                let kind: String = row.get(5)?;
                Ok(MetricsSnapshot {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                    labels: row.get(4)?,
                    metric_type: match kind.as_str() {
                        "gauge" => MetricType::Gauge,
                        "histogram" => MetricType::Histogram,
                        _ => MetricType::Counter,
                    },
                })
            },
        )?;
        rows.collect()
    }

    /// Delete snapshots older than the retention window.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}
