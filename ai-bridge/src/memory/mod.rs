use chrono::Utc;
use std::collections::VecDeque;

use crate::usage::{
    RECENT_LIMIT, StoreError, UsageAggregate, UsagePeriod, UsageRecord, UsageRecordInput, UsageSink,
};

/// Running usage totals for this process.
///
/// Holds everything since startup and ignores time windows: every period
/// answers with the same "since process start" view.
#[derive(Debug, Clone)]
pub struct UsageMemory {
    session_id: String,
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    total_cost: f64,
    requests: VecDeque<UsageRecord>,
}

impl UsageMemory {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            total_cost: 0.0,
            requests: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: UsageRecord) {
        self.total_prompt_tokens = self.total_prompt_tokens.saturating_add(record.prompt_tokens);
        self.total_completion_tokens = self
            .total_completion_tokens
            .saturating_add(record.completion_tokens);
        self.total_cost += record.total_cost;
        self.requests.push_back(record);
    }

    pub fn snapshot(&self, detailed: bool) -> UsageAggregate {
        let requests = if detailed {
            self.requests.iter().rev().take(RECENT_LIMIT).cloned().collect()
        } else {
            Vec::new()
        };

        UsageAggregate {
            total_prompt_tokens: self.total_prompt_tokens,
            total_completion_tokens: self.total_completion_tokens,
            total_tokens: self
                .total_prompt_tokens
                .saturating_add(self.total_completion_tokens),
            total_cost: self.total_cost,
            total_requests: self.requests.len() as u64,
            requests,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl UsageSink for UsageMemory {
    fn record(&mut self, input: &UsageRecordInput) -> Result<(), StoreError> {
        let record = UsageRecord::priced(input, &self.session_id, Utc::now());
        self.push(record);
        Ok(())
    }

    fn aggregate(&self, _period: &UsagePeriod, detailed: bool) -> Result<UsageAggregate, StoreError> {
        Ok(self.snapshot(detailed))
    }
}
