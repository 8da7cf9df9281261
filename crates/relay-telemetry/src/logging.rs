use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log row read back from SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub connection_id: Option<String>,
    pub topic: Option<String>,
}

/// Filters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub connection_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// What one event contributes to the log table.
#[derive(Debug, Default)]
struct LogEntry {
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    connection_id: Option<String>,
    topic: Option<String>,
}

/// SQLite sink for warn+ events. Inserts are best-effort; a failed write
/// never disturbs the caller.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 connection_id TEXT,
                 topic TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_conn ON logs(connection_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &LogEntry) {
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, connection_id, topic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.connection_id,
                entry.topic,
            ],
        );
    }

    /// Search persisted logs, most recent first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, level, target, message, fields, connection_id, topic
             FROM logs
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR target LIKE '%' || ?2 || '%')
               AND (?3 IS NULL OR connection_id = ?3)
               AND (?4 IS NULL OR timestamp >= ?4)
             ORDER BY id DESC LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                q.level,
                q.target,
                q.connection_id,
                q.since,
                q.limit.unwrap_or(100)
            ],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    connection_id: row.get(6)?,
                    topic: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer that persists warn+ events through a [`SqliteLogSink`],
/// pulling out the correlation fields the hub attaches to its events and
/// spans (`connection_id`, `topic`).
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation fields recorded on a span, stashed in its extensions so child
/// events inherit them.
#[derive(Default)]
struct Correlation {
    connection_id: Option<String>,
    topic: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.connection_id.is_none() && self.topic.is_none()
    }

    fn fill_from(&mut self, other: &Correlation) {
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&other.connection_id);
        }
        if self.topic.is_none() {
            self.topic.clone_from(&other.topic);
        }
    }
}

/// Field visitor splitting an event into message, correlation fields, and a
/// JSON bag of everything else.
#[derive(Default)]
struct Collector {
    message: Option<String>,
    correlation: Correlation,
    rest: serde_json::Map<String, serde_json::Value>,
}

impl Collector {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        match name {
            "message" => self.message = value.as_str().map(str::to_owned),
            "connection_id" => {
                self.correlation.connection_id = value.as_str().map(str::to_owned)
            }
            "topic" => self.correlation.topic = value.as_str().map(str::to_owned),
            _ => {
                self.rest.insert(name.to_owned(), value);
            }
        }
    }

    fn fields_json(&self) -> Option<String> {
        if self.rest.is_empty() {
            return None;
        }
        serde_json::to_string(&self.rest).ok()
    }
}

impl Visit for Collector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        // Debug-rendered strings keep their quotes; strip them so ids match.
        let rendered = rendered.trim_matches('"').to_owned();
        self.put(field.name(), serde_json::Value::String(rendered));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), serde_json::Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field.name(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut collector = Collector::default();
        event.record(&mut collector);

        // Correlation not on the event itself may live on an enclosing span.
        if collector.correlation.connection_id.is_none() || collector.correlation.topic.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(fields) = span.extensions().get::<Correlation>() {
                        collector.correlation.fill_from(fields);
                    }
                }
            }
        }

        self.sink.insert(&LogEntry {
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_owned(),
            message: collector.message.clone().unwrap_or_default(),
            fields: collector.fields_json(),
            connection_id: collector.correlation.connection_id,
            topic: collector.correlation.topic,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.correlation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    fn warn_entry(message: &str) -> LogEntry {
        LogEntry {
            level: "WARN".into(),
            target: "relay_hub::router".into(),
            message: message.into(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_count() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn_entry("send queue full"));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_connection() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for conn in ["conn_a", "conn_b"] {
            sink.insert(&LogEntry {
                connection_id: Some(conn.into()),
                ..warn_entry("slow subscriber")
            });
        }

        let results = sink
            .query(&LogQuery {
                connection_id: Some("conn_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].connection_id.as_deref(), Some("conn_a"));
    }

    #[test]
    fn query_by_level_and_target() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&warn_entry("queue pressure"));
        sink.insert(&LogEntry {
            level: "ERROR".into(),
            target: "relay_hub::session".into(),
            message: "socket error".into(),
            ..Default::default()
        });

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "socket error");

        let by_target = sink
            .query(&LogQuery {
                target: Some("session".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_target.len(), 1);
    }

    #[test]
    fn query_limit_returns_most_recent_first() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            sink.insert(&warn_entry(&format!("msg {i}")));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn topic_column_roundtrips() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        sink.insert(&LogEntry {
            connection_id: Some("conn_9".into()),
            topic: Some("thread:42".into()),
            ..warn_entry("dropping subscriber")
        });
        let results = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(results[0].topic.as_deref(), Some("thread:42"));
    }

    #[test]
    fn collector_splits_correlation_from_field_bag() {
        let mut collector = Collector::default();
        collector.put("message", serde_json::Value::String("boom".into()));
        collector.put("connection_id", serde_json::Value::String("conn_1".into()));
        collector.put("topic", serde_json::Value::String("agent:7".into()));
        collector.put("queued", serde_json::Value::from(256));

        assert_eq!(collector.message.as_deref(), Some("boom"));
        assert_eq!(
            collector.correlation.connection_id.as_deref(),
            Some("conn_1")
        );
        assert_eq!(collector.correlation.topic.as_deref(), Some("agent:7"));
        assert_eq!(collector.fields_json().unwrap(), r#"{"queued":256}"#);
    }

    #[test]
    fn correlation_fill_keeps_event_values() {
        let mut event = Correlation {
            connection_id: Some("conn_event".into()),
            topic: None,
        };
        let span = Correlation {
            connection_id: Some("conn_span".into()),
            topic: Some("thread:1".into()),
        };
        event.fill_from(&span);
        assert_eq!(event.connection_id.as_deref(), Some("conn_event"));
        assert_eq!(event.topic.as_deref(), Some("thread:1"));
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-08-01T12:00:00Z".into(),
            level: "WARN".into(),
            target: "relay_hub".into(),
            message: "send queue full".into(),
            fields: Some(r#"{"queued":256}"#.into()),
            connection_id: Some("conn_123".into()),
            topic: Some("agent:7".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.level, "WARN");
        assert_eq!(parsed.connection_id.as_deref(), Some("conn_123"));
    }
}
