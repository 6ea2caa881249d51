//! Usage accounting: record types, time windows, and the two-tier sink.
//!
//! Every successful provider call produces one [`UsageRecordInput`]. The
//! [`UsageLedger`] writes it to the durable store when one is reachable and
//! always mirrors it in memory, so usage queries keep working through a store
//! outage (reporting only what this process has seen).

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::UsageMemory;
use crate::pricing::{ModelPricing, reconcile_cost};

/// Most rows a detailed aggregate carries.
pub const RECENT_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Usage store unavailable: {0}")]
    Unavailable(String),
    #[error("Usage query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum PeriodError {
    #[error("Unknown period '{0}'. Expected one of: all, today, month, session, custom")]
    Unknown(String),
    #[error("Custom period requires both start_date and end_date")]
    MissingBounds,
    #[error("Invalid date '{0}'. Use YYYY-MM-DD or an RFC 3339 timestamp")]
    InvalidDate(String),
    #[error("start_date must not be after end_date")]
    InvertedRange,
}

/// One process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecordInput {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Authoritative cost from the provider; zero means "not supplied".
    pub cost: f64,
    pub pricing: ModelPricing,
    pub request_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
    pub request_type: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Prices an input and stamps it. Token totals are always recomputed.
    pub fn priced(input: &UsageRecordInput, session_id: &str, created_at: DateTime<Utc>) -> Self {
        let breakdown = input.pricing.cost(input.prompt_tokens, input.completion_tokens);
        Self {
            model: input.model.clone(),
            prompt_tokens: input.prompt_tokens,
            completion_tokens: input.completion_tokens,
            total_tokens: input.prompt_tokens.saturating_add(input.completion_tokens),
            prompt_cost: breakdown.prompt_cost,
            completion_cost: breakdown.completion_cost,
            total_cost: reconcile_cost(input.cost, &breakdown),
            request_type: input.request_type.clone(),
            session_id: session_id.to_string(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UsagePeriod {
    All,
    Today,
    Month,
    Session,
    /// Inclusive on both ends.
    Custom {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl UsagePeriod {
    pub fn parse(
        period: &str,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Self, PeriodError> {
        match period {
            "all" => Ok(UsagePeriod::All),
            "today" => Ok(UsagePeriod::Today),
            "month" | "this-month" => Ok(UsagePeriod::Month),
            "session" => Ok(UsagePeriod::Session),
            "custom" => {
                let (Some(start), Some(end)) = (start_date, end_date) else {
                    return Err(PeriodError::MissingBounds);
                };
                let start = parse_bound(start, NaiveTime::MIN)?;
                let end = parse_bound(end, end_of_day())?;
                if start > end {
                    return Err(PeriodError::InvertedRange);
                }
                Ok(UsagePeriod::Custom { start, end })
            }
            other => Err(PeriodError::Unknown(other.to_string())),
        }
    }

    pub fn label(&self) -> String {
        match self {
            UsagePeriod::All => "All Time".to_string(),
            UsagePeriod::Today => "Today".to_string(),
            UsagePeriod::Month => "This Month".to_string(),
            UsagePeriod::Session => "Current Session".to_string(),
            UsagePeriod::Custom { start, end } => format!(
                "{} to {}",
                start.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                end.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            ),
        }
    }

    /// UTC bounds `[from, until)` of a calendar window, evaluated at `now`.
    pub fn calendar_bounds(&self, now: DateTime<Local>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = now.date_naive();
        let (first, next) = match self {
            UsagePeriod::Today => (today, today.succ_opt()?),
            UsagePeriod::Month => {
                let first = today.with_day0(0)?;
                let next = if first.month() == 12 {
                    NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
                };
                (first, next)
            }
            _ => return None,
        };
        Some((local_midnight(first)?, local_midnight(next)?))
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    local_to_utc(date.and_time(NaiveTime::MIN))
}

fn parse_bound(raw: &str, time_of_day: NaiveTime) -> Result<DateTime<Utc>, PeriodError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return local_to_utc(naive).ok_or_else(|| PeriodError::InvalidDate(raw.to_string()));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| PeriodError::InvalidDate(raw.to_string()))?;
    local_to_utc(date.and_time(time_of_day)).ok_or_else(|| PeriodError::InvalidDate(raw.to_string()))
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_requests: u64,
    /// Newest first, at most [`RECENT_LIMIT`]; empty unless a detailed query.
    pub requests: Vec<UsageRecord>,
}

/// Anything that can take usage records and answer aggregate queries.
pub trait UsageSink: Send {
    fn record(&mut self, input: &UsageRecordInput) -> Result<(), StoreError>;

    fn aggregate(&self, period: &UsagePeriod, detailed: bool) -> Result<UsageAggregate, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UsageSource {
    Durable,
    /// The in-memory mirror answered because the store failed.
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub aggregate: UsageAggregate,
    pub source: UsageSource,
}

/// Durable store first, in-memory mirror second.
pub struct UsageLedger {
    durable: Option<Box<dyn UsageSink>>,
    fallback: UsageMemory,
}

impl UsageLedger {
    pub fn new(durable: Option<Box<dyn UsageSink>>, session: &Session) -> Self {
        Self {
            durable,
            fallback: UsageMemory::new(session.id.clone()),
        }
    }

    /// Memory is updated even when the durable write fails; the failed write is dropped.
    pub fn record(&mut self, input: &UsageRecordInput) {
        if let Err(e) = self.fallback.record(input) {
            warn!(error = %e, "In-memory usage update failed");
        }

        if let Some(durable) = self.durable.as_mut() {
            match durable.record(input) {
                Ok(()) => debug!(model = %input.model, "Usage recorded"),
                Err(e) => warn!(error = %e, "Failed to persist usage record"),
            }
        }
    }

    pub fn aggregate(&self, period: &UsagePeriod, detailed: bool) -> UsageReport {
        let reason = match self.durable.as_ref() {
            Some(durable) => match durable.aggregate(period, detailed) {
                Ok(aggregate) => {
                    return UsageReport {
                        aggregate,
                        source: UsageSource::Durable,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "Usage query fell back to session data");
                    e.to_string()
                }
            },
            None => "no usage store configured".to_string(),
        };

        UsageReport {
            aggregate: self.fallback.snapshot(detailed),
            source: UsageSource::Fallback { reason },
        }
    }

    pub fn memory(&self) -> &UsageMemory {
        &self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct DownStore;

    impl UsageSink for DownStore {
        fn record(&mut self, _input: &UsageRecordInput) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn aggregate(&self, _period: &UsagePeriod, _detailed: bool) -> Result<UsageAggregate, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn input(prompt: u64, completion: u64, cost: f64) -> UsageRecordInput {
        UsageRecordInput {
            model: "gemini-pro".to_string(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            cost,
            pricing: ModelPricing::tiered(1.25, 2.50, 10.0, 15.0),
            request_type: "ask_ai".to_string(),
        }
    }

    #[test]
    fn test_priced_record_recomputes_total_and_cost() {
        let record = UsageRecord::priced(&input(250_000, 1_000, 0.0), "s1", Utc::now());
        assert_eq!(record.total_tokens, 251_000);
        assert_eq!(record.prompt_cost, 200000.0 / 1e6 * 1.25 + 50000.0 / 1e6 * 2.50);
        assert!((record.completion_cost - 0.01).abs() < 1e-12);
        assert_eq!(record.total_cost, record.prompt_cost + record.completion_cost);
    }

    #[test]
    fn test_priced_record_total_saturates() {
        let record = UsageRecord::priced(&input(u64::MAX, 10, 0.0), "s1", Utc::now());
        assert_eq!(record.total_tokens, u64::MAX);
    }

    #[test]
    fn test_session_start() {
        let before = Utc::now();
        let session = Session::start();
        assert!(session.started_at >= before);
        assert_eq!(session.id.len(), 36);
        assert_ne!(session.id, Session::start().id);
    }

    #[test]
    fn test_priced_record_keeps_provider_cost() {
        let record = UsageRecord::priced(&input(10, 10, 0.42), "s1", Utc::now());
        assert_eq!(record.total_cost, 0.42);
    }

    #[rstest]
    #[case("all", UsagePeriod::All)]
    #[case("today", UsagePeriod::Today)]
    #[case("month", UsagePeriod::Month)]
    #[case("this-month", UsagePeriod::Month)]
    #[case("session", UsagePeriod::Session)]
    fn test_parse_named_periods(#[case] raw: &str, #[case] expected: UsagePeriod) {
        assert_eq!(UsagePeriod::parse(raw, None, None).unwrap(), expected);
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some("2025-01-01"), None)]
    #[case(None, Some("2025-01-31"))]
    fn test_custom_requires_both_bounds(#[case] start: Option<&str>, #[case] end: Option<&str>) {
        assert_eq!(
            UsagePeriod::parse("custom", start, end),
            Err(PeriodError::MissingBounds)
        );
    }

    #[test]
    fn test_custom_date_only_end_covers_whole_day() {
        let period = UsagePeriod::parse("custom", Some("2025-01-01"), Some("2025-01-01")).unwrap();
        let UsagePeriod::Custom { start, end } = period else {
            panic!("expected custom period");
        };
        assert_eq!((end - start).num_seconds(), 86_399);
    }

    #[test]
    fn test_custom_rejects_garbage_and_inverted() {
        assert!(matches!(
            UsagePeriod::parse("custom", Some("yesterday"), Some("2025-01-01")),
            Err(PeriodError::InvalidDate(_))
        ));
        assert_eq!(
            UsagePeriod::parse("custom", Some("2025-02-01"), Some("2025-01-01")),
            Err(PeriodError::InvertedRange)
        );
    }

    #[test]
    fn test_unknown_period_rejected() {
        assert!(matches!(
            UsagePeriod::parse("fortnight", None, None),
            Err(PeriodError::Unknown(_))
        ));
    }

    #[test]
    fn test_month_bounds_roll_over_year() {
        let now = Local.with_ymd_and_hms(2025, 12, 15, 12, 0, 0).earliest().unwrap();
        let (from, until) = UsagePeriod::Month.calendar_bounds(now).unwrap();
        assert_eq!(from.with_timezone(&Local).date_naive(), NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(until.with_timezone(&Local).date_naive(), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert!(UsagePeriod::All.calendar_bounds(now).is_none());
    }

    #[test]
    fn test_ledger_falls_back_when_store_down() {
        let session = Session::start();
        let mut ledger = UsageLedger::new(Some(Box::new(DownStore)), &session);
        for _ in 0..3 {
            ledger.record(&input(5, 2, 0.0));
        }

        let report = ledger.aggregate(&UsagePeriod::Session, false);
        assert!(matches!(report.source, UsageSource::Fallback { .. }));
        assert_eq!(report.aggregate.total_requests, 3);
        assert_eq!(report.aggregate.total_tokens, 21);
    }

    #[test]
    fn test_ledger_without_store_reports_reason() {
        let session = Session::start();
        let ledger = UsageLedger::new(None, &session);
        let report = ledger.aggregate(&UsagePeriod::All, true);
        assert_eq!(
            report.source,
            UsageSource::Fallback {
                reason: "no usage store configured".to_string()
            }
        );
        assert!(report.aggregate.requests.is_empty());
    }
}
