//! SQLite-backed usage ledger.
//!
//! A connection is opened for each operation and dropped afterwards. The file
//! is only created by [`SqliteUsageStore::initialize`]; a missing file later on
//! means the store is unreachable rather than empty.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::usage::{
    RECENT_LIMIT, StoreError, UsageAggregate, UsagePeriod, UsageRecord, UsageRecordInput, UsageSink,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    prompt_cost REAL NOT NULL,
    completion_cost REAL NOT NULL,
    total_cost REAL NOT NULL,
    request_type TEXT NOT NULL,
    session_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_records_created_at ON usage_records(created_at);
CREATE INDEX IF NOT EXISTS idx_usage_records_session_id ON usage_records(session_id);
"#;

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::Query(error.to_string())
    }
}

pub struct SqliteUsageStore {
    path: PathBuf,
    session_id: String,
}

impl SqliteUsageStore {
    pub fn new(path: impl Into<PathBuf>, session_id: String) -> Self {
        Self {
            path: path.into(),
            session_id,
        }
    }

    /// Accepts `sqlite://path`, `sqlite:path`, or a bare file path.
    pub fn from_url(url: &str, session_id: String) -> Result<Self, StoreError> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url)
            .trim();

        if path.is_empty() || path == ":memory:" {
            return Err(StoreError::Unavailable(format!(
                "'{url}' does not name a database file"
            )));
        }
        if url.contains("://") && !url.starts_with("sqlite://") {
            return Err(StoreError::Unavailable(format!(
                "unsupported connection string '{url}'"
            )));
        }

        Ok(Self::new(path, session_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the database file and schema if needed.
    pub fn initialize(&self) -> Result<(), StoreError> {
        info!(path = ?self.path, "Initializing usage store");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("Failed to create directory: {e}"))
                })?;
            }
        }

        let conn = Connection::open(&self.path)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO usage_records
                (model, prompt_tokens, completion_tokens, total_tokens,
                 prompt_cost, completion_cost, total_cost, request_type, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.model,
                to_sql_int(record.prompt_tokens),
                to_sql_int(record.completion_tokens),
                to_sql_int(record.total_tokens),
                record.prompt_cost,
                record.completion_cost,
                record.total_cost,
                record.request_type,
                record.session_id,
                format_timestamp(&record.created_at),
            ],
        )?;
        Ok(())
    }

    fn filter(&self, period: &UsagePeriod) -> (String, Vec<String>) {
        match period {
            UsagePeriod::All => (String::new(), Vec::new()),
            UsagePeriod::Session => (
                "WHERE session_id = ?1".to_string(),
                vec![self.session_id.clone()],
            ),
            UsagePeriod::Today | UsagePeriod::Month => match period.calendar_bounds(Local::now()) {
                Some((from, until)) => (
                    "WHERE created_at >= ?1 AND created_at < ?2".to_string(),
                    vec![format_timestamp(&from), format_timestamp(&until)],
                ),
                None => (String::new(), Vec::new()),
            },
            UsagePeriod::Custom { start, end } => (
                "WHERE created_at BETWEEN ?1 AND ?2".to_string(),
                vec![format_timestamp(start), format_timestamp(end)],
            ),
        }
    }

    fn recent(
        conn: &Connection,
        where_clause: &str,
        values: &[String],
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let sql = format!(
            "SELECT model, prompt_tokens, completion_tokens, total_tokens,
                    prompt_cost, completion_cost, total_cost, request_type, session_id, created_at
             FROM usage_records
             {where_clause}
             ORDER BY created_at DESC, id DESC
             LIMIT {RECENT_LIMIT}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((
                UsageRecord {
                    model: row.get(0)?,
                    prompt_tokens: from_sql_int(row.get(1)?),
                    completion_tokens: from_sql_int(row.get(2)?),
                    total_tokens: from_sql_int(row.get(3)?),
                    prompt_cost: row.get(4)?,
                    completion_cost: row.get(5)?,
                    total_cost: row.get(6)?,
                    request_type: row.get(7)?,
                    session_id: row.get(8)?,
                    created_at: DateTime::<Utc>::MIN_UTC,
                },
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (mut record, created_at) = row?;
            record.created_at = parse_timestamp(&created_at)?;
            records.push(record);
        }
        Ok(records)
    }
}

impl UsageSink for SqliteUsageStore {
    fn record(&mut self, input: &UsageRecordInput) -> Result<(), StoreError> {
        let record = UsageRecord::priced(input, &self.session_id, Utc::now());
        self.append(&record)
    }

    fn aggregate(&self, period: &UsagePeriod, detailed: bool) -> Result<UsageAggregate, StoreError> {
        let conn = self.connect()?;
        let (where_clause, values) = self.filter(period);
        debug!(?period, detailed, "Querying usage store");

        let sql = format!(
            "SELECT
                COALESCE(SUM(prompt_tokens), 0),
                COALESCE(SUM(completion_tokens), 0),
                COALESCE(SUM(total_tokens), 0),
                COALESCE(SUM(total_cost), 0.0),
                COUNT(*)
             FROM usage_records
             {where_clause}"
        );
        let mut aggregate = conn.query_row(&sql, params_from_iter(values.iter()), |row| {
            Ok(UsageAggregate {
                total_prompt_tokens: from_sql_int(row.get(0)?),
                total_completion_tokens: from_sql_int(row.get(1)?),
                total_tokens: from_sql_int(row.get(2)?),
                total_cost: row.get(3)?,
                total_requests: from_sql_int(row.get(4)?),
                requests: Vec::new(),
            })
        })?;

        if detailed {
            aggregate.requests = Self::recent(&conn, &where_clause, &values)?;
        }

        Ok(aggregate)
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Query(format!("bad created_at '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPricing;
    use chrono::Duration;
    use rstest::rstest;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, session: &str) -> SqliteUsageStore {
        let store = SqliteUsageStore::new(dir.path().join("usage.db"), session.to_string());
        store.initialize().unwrap();
        store
    }

    fn input(model: &str, prompt: u64, completion: u64, cost: f64) -> UsageRecordInput {
        UsageRecordInput {
            model: model.to_string(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            cost,
            pricing: ModelPricing::tiered(1.25, 2.50, 10.0, 15.0),
            request_type: "ask_ai".to_string(),
        }
    }

    fn record_at(model: &str, session: &str, created_at: DateTime<Utc>) -> UsageRecord {
        UsageRecord::priced(&input(model, 10, 5, 0.0), session, created_at)
    }

    #[rstest]
    #[case("sqlite:///tmp/usage.db", "/tmp/usage.db")]
    #[case("sqlite:usage.db", "usage.db")]
    #[case("data/usage.db", "data/usage.db")]
    fn test_from_url(#[case] url: &str, #[case] expected: &str) {
        let store = SqliteUsageStore::from_url(url, "s".into()).unwrap();
        assert_eq!(store.path(), Path::new(expected));
    }

    #[rstest]
    #[case("")]
    #[case(":memory:")]
    #[case("postgres://localhost/usage")]
    fn test_from_url_rejects(#[case] url: &str) {
        assert!(matches!(
            SqliteUsageStore::from_url(url, "s".into()),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_record_and_aggregate_all() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, "s1");
        store.record(&input("gemini-pro", 250_000, 1_000, 0.0)).unwrap();
        store.record(&input("gemini-pro", 5, 2, 0.5)).unwrap();

        let aggregate = store.aggregate(&UsagePeriod::All, false).unwrap();
        assert_eq!(aggregate.total_prompt_tokens, 250_005);
        assert_eq!(aggregate.total_completion_tokens, 1_002);
        assert_eq!(aggregate.total_tokens, 251_007);
        assert_eq!(aggregate.total_requests, 2);
        let tiered = 200000.0 / 1e6 * 1.25 + 50000.0 / 1e6 * 2.50 + 1000.0 / 1e6 * 10.0;
        assert!((aggregate.total_cost - (tiered + 0.5)).abs() < 1e-9);
        assert!(aggregate.requests.is_empty());
    }

    #[test]
    fn test_persisted_total_is_sum_of_parts() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, "s1");
        store.record(&input("m", 40, 2, 0.0)).unwrap();

        let aggregate = store.aggregate(&UsagePeriod::All, true).unwrap();
        let row = &aggregate.requests[0];
        assert_eq!(row.total_tokens, row.prompt_tokens + row.completion_tokens);
    }

    #[test]
    fn test_empty_store_aggregates_to_zero() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "s1");
        let aggregate = store.aggregate(&UsagePeriod::Today, true).unwrap();
        assert_eq!(aggregate, UsageAggregate::default());
    }

    #[test]
    fn test_session_filter() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "current");
        let now = Utc::now();
        store.append(&record_at("a", "previous", now)).unwrap();
        store.append(&record_at("b", "current", now)).unwrap();
        store.append(&record_at("c", "current", now)).unwrap();

        let aggregate = store.aggregate(&UsagePeriod::Session, false).unwrap();
        assert_eq!(aggregate.total_requests, 2);
    }

    #[test]
    fn test_today_and_month_filters() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "s");
        let now = Utc::now();
        store.append(&record_at("now", "s", now)).unwrap();
        store.append(&record_at("old", "s", now - Duration::days(400))).unwrap();

        assert_eq!(store.aggregate(&UsagePeriod::Today, false).unwrap().total_requests, 1);
        assert_eq!(store.aggregate(&UsagePeriod::Month, false).unwrap().total_requests, 1);
        assert_eq!(store.aggregate(&UsagePeriod::All, false).unwrap().total_requests, 2);
    }

    #[test]
    fn test_custom_range_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "s");
        let start = Utc::now() - Duration::days(10);
        let end = start + Duration::days(2);
        store.append(&record_at("at-start", "s", start)).unwrap();
        store.append(&record_at("at-end", "s", end)).unwrap();
        store.append(&record_at("after", "s", end + Duration::seconds(1))).unwrap();

        let aggregate = store
            .aggregate(&UsagePeriod::Custom { start, end }, true)
            .unwrap();
        assert_eq!(aggregate.total_requests, 2);
        assert_eq!(aggregate.requests[0].model, "at-end");
        assert_eq!(aggregate.requests[1].model, "at-start");
    }

    #[test]
    fn test_detailed_returns_recent_twenty_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "s");
        let base = Utc::now() - Duration::hours(1);
        for i in 0..25 {
            store
                .append(&record_at(&format!("m{i}"), "s", base + Duration::seconds(i)))
                .unwrap();
        }

        let aggregate = store.aggregate(&UsagePeriod::All, true).unwrap();
        assert_eq!(aggregate.total_requests, 25);
        assert_eq!(aggregate.requests.len(), RECENT_LIMIT);
        assert_eq!(aggregate.requests[0].model, "m24");
        assert_eq!(aggregate.requests[19].model, "m5");
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, "s");
        std::fs::remove_file(store.path()).unwrap();

        assert!(matches!(
            store.record(&input("m", 1, 1, 0.0)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.aggregate(&UsagePeriod::All, false),
            Err(StoreError::Unavailable(_))
        ));
        // The failed open must not recreate the file.
        assert!(!store.path().exists());
    }
}
