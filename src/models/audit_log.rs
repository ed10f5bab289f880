use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BillingPeriod;

/// Endpoint marker stored on aggregated rows.
pub const AGGREGATED_ENDPOINT: &str = "__aggregated__";

/// Provider marker stored on aggregated rows, which span every provider.
pub const AGGREGATED_PROVIDER: &str = "*";

/// Status breakdown key for calls reported without an HTTP status.
const UNKNOWN_STATUS: &str = "unknown";

/// One row of the append-only usage audit log.
///
/// A row is either a single reported call or an aggregated row produced by
/// compaction, which stands in for every older row of the same user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Insertion sequence number.
    pub id: i64,
    pub user_id: String,
    pub occurred_at: DateTime<Utc>,
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: String,
    pub calls: i64,
    pub tokens: i64,
    /// Cost in microcents
    pub cost_microcents: i64,
    pub status_code: Option<i32>,
    pub retry_count: i64,
    pub billing_period: BillingPeriod,
    /// Present only on aggregated rows.
    pub aggregate: Option<AggregateDetails>,
}

impl AuditLogEntry {
    pub fn is_aggregated(&self) -> bool {
        self.aggregate.is_some()
    }
}

/// Input for appending a raw audit log row.
#[derive(Debug, Clone)]
pub struct NewAuditLogEntry {
    pub user_id: String,
    pub occurred_at: DateTime<Utc>,
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: String,
    pub calls: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
    pub status_code: Option<i32>,
    pub retry_count: i64,
    pub billing_period: BillingPeriod,
}

/// What an aggregated row represents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDetails {
    /// Raw rows folded into this row, across all compactions.
    pub rows_compacted: i64,
    /// Number of raw rows per HTTP status (`"unknown"` when none was reported).
    pub status_breakdown: BTreeMap<String, i64>,
    pub earliest_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
}

/// Sums over a set of audit log rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditTotals {
    pub rows: i64,
    pub calls: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
}

/// The single row that replaces a set of compacted rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditAggregate {
    pub user_id: String,
    /// Latest timestamp among the folded rows.
    pub occurred_at: DateTime<Utc>,
    pub billing_period: BillingPeriod,
    pub calls: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
    pub retry_count: i64,
    pub details: AggregateDetails,
}

impl AuditAggregate {
    /// Fold rows (raw or previously aggregated) into one aggregate.
    ///
    /// Returns `None` for an empty slice. Sums are saturating.
    pub fn fold(rows: &[AuditLogEntry]) -> Option<Self> {
        let latest = rows.iter().max_by_key(|r| (r.occurred_at, r.id))?;
        let mut aggregate = AuditAggregate {
            user_id: latest.user_id.clone(),
            occurred_at: latest.occurred_at,
            billing_period: latest.billing_period,
            calls: 0,
            tokens: 0,
            cost_microcents: 0,
            retry_count: 0,
            details: AggregateDetails::default(),
        };

        for row in rows {
            aggregate.calls = aggregate.calls.saturating_add(row.calls);
            aggregate.tokens = aggregate.tokens.saturating_add(row.tokens);
            aggregate.cost_microcents = aggregate.cost_microcents.saturating_add(row.cost_microcents);
            aggregate.retry_count = aggregate.retry_count.saturating_add(row.retry_count);

            let details = &mut aggregate.details;
            match &row.aggregate {
                Some(previous) => {
                    details.rows_compacted += previous.rows_compacted;
                    for (status, count) in &previous.status_breakdown {
                        *details.status_breakdown.entry(status.clone()).or_default() += count;
                    }
                    details.earliest_at = min_time(details.earliest_at, previous.earliest_at);
                    details.latest_at = max_time(details.latest_at, previous.latest_at);
                }
                None => {
                    details.rows_compacted += 1;
                    let status = row
                        .status_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
                    *details.status_breakdown.entry(status).or_default() += 1;
                    details.earliest_at = min_time(details.earliest_at, Some(row.occurred_at));
                    details.latest_at = max_time(details.latest_at, Some(row.occurred_at));
                }
            }
        }

        Some(aggregate)
    }
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn raw(id: i64, minutes: i64, status: Option<i32>) -> AuditLogEntry {
        let base = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        AuditLogEntry {
            id,
            user_id: "user-1".into(),
            occurred_at: base + Duration::minutes(minutes),
            provider: "openai".into(),
            model: Some("gpt-4o".into()),
            endpoint: "chat".into(),
            calls: 1,
            tokens: 100,
            cost_microcents: 250,
            status_code: status,
            retry_count: 1,
            billing_period: BillingPeriod::new(2026, 1).unwrap(),
            aggregate: None,
        }
    }

    #[test]
    fn test_fold_empty() {
        assert!(AuditAggregate::fold(&[]).is_none());
    }

    #[test]
    fn test_fold_raw_rows() {
        let rows = vec![raw(1, 0, Some(200)), raw(2, 5, Some(429)), raw(3, 2, None)];
        let aggregate = AuditAggregate::fold(&rows).unwrap();

        assert_eq!(aggregate.calls, 3);
        assert_eq!(aggregate.tokens, 300);
        assert_eq!(aggregate.cost_microcents, 750);
        assert_eq!(aggregate.retry_count, 3);
        assert_eq!(aggregate.occurred_at, rows[1].occurred_at);
        assert_eq!(aggregate.details.rows_compacted, 3);
        assert_eq!(aggregate.details.status_breakdown["200"], 1);
        assert_eq!(aggregate.details.status_breakdown["429"], 1);
        assert_eq!(aggregate.details.status_breakdown["unknown"], 1);
        assert_eq!(aggregate.details.earliest_at, Some(rows[0].occurred_at));
        assert_eq!(aggregate.details.latest_at, Some(rows[1].occurred_at));
    }

    #[test]
    fn test_fold_merges_previous_aggregate() {
        let first = AuditAggregate::fold(&[raw(1, 0, Some(200)), raw(2, 1, Some(200))]).unwrap();
        let previous = AuditLogEntry {
            id: 10,
            provider: AGGREGATED_PROVIDER.into(),
            endpoint: AGGREGATED_ENDPOINT.into(),
            model: None,
            calls: first.calls,
            tokens: first.tokens,
            cost_microcents: first.cost_microcents,
            retry_count: first.retry_count,
            occurred_at: first.occurred_at,
            aggregate: Some(first.details.clone()),
            ..raw(10, 1, None)
        };

        let merged = AuditAggregate::fold(&[previous, raw(11, 30, Some(500))]).unwrap();
        assert_eq!(merged.calls, 3);
        assert_eq!(merged.tokens, 300);
        assert_eq!(merged.details.rows_compacted, 3);
        assert_eq!(merged.details.status_breakdown["200"], 2);
        assert_eq!(merged.details.status_breakdown["500"], 1);
        assert!(!merged.details.status_breakdown.contains_key("unknown"));
        assert_eq!(merged.details.earliest_at, first.details.earliest_at);
    }
}
