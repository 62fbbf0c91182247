//! Usage accounting and quota enforcement (§4.L).
//!
//! Classification rules and calendar-month period math are grounded on
//! the original `usage_tracking_middleware`
//! (`middleware/usage_tracking.py`); the plan limits table is this
//! crate's own supplemented detail, documented in SPEC_FULL.md §4.L and
//! DESIGN.md since the Python source only worked one example (the free
//! plan's `documents_uploaded` limit).

use crate::domain::{Plan, RateLimitOverride, UsageRecord};
use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

/// `-1` on a plan limit or override field means unlimited.
const UNLIMITED: i64 = -1;

/// One tracked counter a call can be billed against. A single API call
/// may increment several: every call increments `ApiCalls`, and an
/// ingest call additionally increments `DocumentsUploaded`, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ApiCalls,
    DocumentsUploaded,
    AiRequests,
    SearchQueries,
    BuildSuggestions,
}

/// Which counters a given operation increments, mirroring the
/// middleware's path-substring classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ingest,
    ExtractConcepts,
    Summarize,
    Search,
    Suggest,
    Other,
}

impl Operation {
    pub fn counters(self) -> Vec<Counter> {
        let mut counters = vec![Counter::ApiCalls];
        match self {
            Operation::Ingest => counters.push(Counter::DocumentsUploaded),
            Operation::ExtractConcepts | Operation::Summarize => counters.push(Counter::AiRequests),
            Operation::Search => counters.push(Counter::SearchQueries),
            Operation::Suggest => counters.push(Counter::BuildSuggestions),
            Operation::Other => {}
        }
        counters
    }
}

struct PlanLimits {
    documents_per_month: i64,
    ai_requests_per_day: i64,
    search_queries_per_day: i64,
    build_suggestions_per_day: i64,
    storage_mb: i64,
    knowledge_bases: i64,
}

fn limits_for(plan: Plan) -> PlanLimits {
    match plan {
        Plan::Free => PlanLimits {
            documents_per_month: 50,
            ai_requests_per_day: 20,
            search_queries_per_day: 50,
            build_suggestions_per_day: 3,
            storage_mb: 500,
            knowledge_bases: 1,
        },
        Plan::Starter => PlanLimits {
            documents_per_month: 500,
            ai_requests_per_day: 200,
            search_queries_per_day: 500,
            build_suggestions_per_day: 20,
            storage_mb: 5_000,
            knowledge_bases: 3,
        },
        Plan::Pro => PlanLimits {
            documents_per_month: 5_000,
            ai_requests_per_day: 2_000,
            search_queries_per_day: 5_000,
            build_suggestions_per_day: 100,
            storage_mb: 50_000,
            knowledge_bases: 10,
        },
        Plan::Enterprise => PlanLimits {
            documents_per_month: UNLIMITED,
            ai_requests_per_day: UNLIMITED,
            search_queries_per_day: UNLIMITED,
            build_suggestions_per_day: UNLIMITED,
            storage_mb: UNLIMITED,
            knowledge_bases: UNLIMITED,
        },
    }
}

/// First instant of the calendar month containing `now`, UTC.
pub fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0).single().expect("valid calendar date")
}

/// Last instant of the calendar month containing `now`, UTC.
pub fn period_end(now: DateTime<Utc>) -> DateTime<Utc> {
    let start = period_start(now);
    let next_month_start = if start.month() == 12 {
        Utc.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0)
    } else {
        Utc.with_ymd_and_hms(start.year(), start.month() + 1, 1, 0, 0, 0)
    }
    .single()
    .expect("valid calendar date");
    next_month_start - Duration::seconds(1)
}

/// A fresh, zeroed usage record for `username` covering the calendar
/// month containing `now`.
pub fn new_period_record(username: &str, subscription_id: Option<i64>, now: DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        id: 0,
        username: username.to_string(),
        subscription_id,
        period_start: period_start(now),
        period_end: period_end(now),
        api_calls: 0,
        documents_uploaded: 0,
        ai_requests: 0,
        storage_bytes: 0,
        search_queries: 0,
        build_suggestions: 0,
        created_at: now,
    }
}

/// Resolve the effective limit for one counter: a per-user override
/// (when `Some`) always wins over the plan default.
fn effective_limit(counter: Counter, plan: Plan, override_: Option<&RateLimitOverride>) -> i64 {
    let plan_limits = limits_for(plan);
    let overridden = override_.and_then(|o| match counter {
        Counter::DocumentsUploaded => o.documents_per_month,
        Counter::AiRequests => o.ai_requests_per_day,
        Counter::ApiCalls => o.api_calls_per_day,
        _ => None,
    });
    overridden.unwrap_or(match counter {
        Counter::DocumentsUploaded => plan_limits.documents_per_month,
        Counter::AiRequests => plan_limits.ai_requests_per_day,
        Counter::SearchQueries => plan_limits.search_queries_per_day,
        Counter::BuildSuggestions => plan_limits.build_suggestions_per_day,
        Counter::ApiCalls => UNLIMITED,
    })
}

fn current_value(record: &UsageRecord, counter: Counter) -> i64 {
    match counter {
        Counter::ApiCalls => record.api_calls,
        Counter::DocumentsUploaded => record.documents_uploaded,
        Counter::AiRequests => record.ai_requests,
        Counter::SearchQueries => record.search_queries,
        Counter::BuildSuggestions => record.build_suggestions,
    }
}

fn increment(record: &mut UsageRecord, counter: Counter) {
    match counter {
        Counter::ApiCalls => record.api_calls += 1,
        Counter::DocumentsUploaded => record.documents_uploaded += 1,
        Counter::AiRequests => record.ai_requests += 1,
        Counter::SearchQueries => record.search_queries += 1,
        Counter::BuildSuggestions => record.build_suggestions += 1,
    }
}

/// Check whether `operation` may be admitted for `record` under `plan`
/// (with an optional override), *before* doing the work it accounts
/// for. A gate, not a post-hoc count — admit, then call
/// [`record_usage`] once the work actually happens.
pub fn check_quota(
    record: &UsageRecord,
    plan: Plan,
    override_: Option<&RateLimitOverride>,
    operation: Operation,
) -> Result<()> {
    for counter in operation.counters() {
        let limit = effective_limit(counter, plan, override_);
        if limit == UNLIMITED {
            continue;
        }
        if current_value(record, counter) >= limit {
            return Err(AppError::Quota(format!(
                "{:?} limit of {limit} reached for the current period",
                counter
            )));
        }
    }
    Ok(())
}

/// Storage quota is checked independently of the per-operation
/// counters above since it is a gauge, not a monotonic counter.
pub fn check_storage_quota(
    current_bytes: i64,
    additional_bytes: i64,
    plan: Plan,
    override_: Option<&RateLimitOverride>,
) -> Result<()> {
    let limit_mb = override_.and_then(|o| o.storage_mb).unwrap_or(limits_for(plan).storage_mb);
    if limit_mb == UNLIMITED {
        return Ok(());
    }
    let limit_bytes = limit_mb * 1024 * 1024;
    if current_bytes + additional_bytes > limit_bytes {
        return Err(AppError::Quota(format!("storage limit of {limit_mb} MB reached")));
    }
    Ok(())
}

pub fn check_knowledge_base_quota(
    current_count: i64,
    plan: Plan,
    override_: Option<&RateLimitOverride>,
) -> Result<()> {
    let limit = override_.and_then(|o| o.knowledge_bases).unwrap_or(limits_for(plan).knowledge_bases);
    if limit == UNLIMITED {
        return Ok(());
    }
    if current_count >= limit {
        return Err(AppError::Quota(format!("knowledge base limit of {limit} reached for the {} plan", plan.as_str())));
    }
    Ok(())
}

/// Record that `operation` happened: increments every counter it maps
/// to. Call only after [`check_quota`] admitted the work.
pub fn record_usage(record: &mut UsageRecord, operation: Operation, storage_delta_bytes: i64) {
    for counter in operation.counters() {
        increment(record, counter);
    }
    record.storage_bytes += storage_delta_bytes;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_covers_the_whole_calendar_month() {
        let now = Utc.with_ymd_and_hms(2026, 2, 15, 12, 0, 0).unwrap();
        let start = period_start(now);
        let end = period_end(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 28, 23, 59, 59).unwrap());
    }

    #[test]
    fn december_period_rolls_into_next_year() {
        let now = Utc.with_ymd_and_hms(2026, 12, 10, 0, 0, 0).unwrap();
        let end = period_end(now);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap());
    }

    #[test]
    fn ingest_increments_documents_and_api_calls() {
        let now = Utc::now();
        let mut record = new_period_record("alice", None, now);
        record_usage(&mut record, Operation::Ingest, 1024);
        assert_eq!(record.api_calls, 1);
        assert_eq!(record.documents_uploaded, 1);
        assert_eq!(record.storage_bytes, 1024);
    }

    #[test]
    fn free_plan_blocks_at_fifty_documents() {
        let now = Utc::now();
        let mut record = new_period_record("bob", None, now);
        record.documents_uploaded = 50;
        let result = check_quota(&record, Plan::Free, None, Operation::Ingest);
        assert!(result.is_err());
    }

    #[test]
    fn enterprise_plan_is_unlimited() {
        let now = Utc::now();
        let mut record = new_period_record("acme", None, now);
        record.documents_uploaded = 1_000_000;
        let result = check_quota(&record, Plan::Enterprise, None, Operation::Ingest);
        assert!(result.is_ok());
    }

    #[test]
    fn override_raises_the_plan_default() {
        let now = Utc::now();
        let mut record = new_period_record("carol", None, now);
        record.documents_uploaded = 60;
        let override_ = RateLimitOverride {
            username: "carol".to_string(),
            api_calls_per_minute: None,
            api_calls_per_day: None,
            documents_per_month: Some(100),
            ai_requests_per_day: None,
            storage_mb: None,
            knowledge_bases: None,
            reason: Some("pilot customer".to_string()),
            granted_by: Some("admin".to_string()),
            expires_at: None,
        };
        assert!(check_quota(&record, Plan::Free, Some(&override_), Operation::Ingest).is_ok());
    }

    #[test]
    fn storage_quota_rejects_when_it_would_exceed_the_limit() {
        let limit_bytes = 500 * 1024 * 1024;
        let result = check_storage_quota(limit_bytes - 100, 200, Plan::Free, None);
        assert!(result.is_err());
    }

    #[test]
    fn knowledge_base_quota_enforced_per_plan() {
        assert!(check_knowledge_base_quota(1, Plan::Free, None).is_err());
        assert!(check_knowledge_base_quota(0, Plan::Free, None).is_ok());
    }
}
