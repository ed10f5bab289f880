use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BillingPeriod, ProviderUsage, UsageStatus, UsageSummary};

/// How a subscription change relates to the previous plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalType {
    New,
    Renewal,
    Upgrade,
    Downgrade,
}

impl RenewalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalType::New => "new",
            RenewalType::Renewal => "renewal",
            RenewalType::Upgrade => "upgrade",
            RenewalType::Downgrade => "downgrade",
        }
    }

    /// Classify a plan change by tier rank.
    ///
    /// Without a stored subscription the user was on the free plan, so moving
    /// above its rank is an upgrade and anything else is a new subscription.
    pub fn classify(previous_rank: i32, had_subscription: bool, new_rank: i32) -> Self {
        match (had_subscription, new_rank.cmp(&previous_rank)) {
            (_, std::cmp::Ordering::Greater) => RenewalType::Upgrade,
            (false, _) => RenewalType::New,
            (true, std::cmp::Ordering::Equal) => RenewalType::Renewal,
            (true, std::cmp::Ordering::Less) => RenewalType::Downgrade,
        }
    }
}

impl std::str::FromStr for RenewalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(RenewalType::New),
            "renewal" => Ok(RenewalType::Renewal),
            "upgrade" => Ok(RenewalType::Upgrade),
            "downgrade" => Ok(RenewalType::Downgrade),
            _ => Err(format!("Invalid renewal type: {}", s)),
        }
    }
}

/// Fidelity level of a renewal record's usage snapshot.
///
/// Tiers are ordered; a record only ever moves to a higher tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTier {
    /// Full snapshot.
    #[default]
    Full,
    /// Snapshot reduced to its totals.
    Compressed,
    /// Snapshot removed; payment and period fields kept.
    Nulled,
    /// Flagged for archival. Nothing is deleted automatically.
    ArchiveEligible,
}

impl RetentionTier {
    pub const ALL: [RetentionTier; 4] = [
        RetentionTier::Full,
        RetentionTier::Compressed,
        RetentionTier::Nulled,
        RetentionTier::ArchiveEligible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionTier::Full => "full",
            RetentionTier::Compressed => "compressed",
            RetentionTier::Nulled => "nulled",
            RetentionTier::ArchiveEligible => "archive_eligible",
        }
    }

    /// Apply this tier's degradation to a snapshot.
    pub fn degrade(&self, snapshot: Option<UsageSnapshot>) -> Option<UsageSnapshot> {
        match self {
            RetentionTier::Full => snapshot,
            RetentionTier::Compressed => snapshot.map(UsageSnapshot::compress),
            RetentionTier::Nulled | RetentionTier::ArchiveEligible => None,
        }
    }
}

impl std::str::FromStr for RetentionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(RetentionTier::Full),
            "compressed" => Ok(RetentionTier::Compressed),
            "nulled" => Ok(RetentionTier::Nulled),
            "archive_eligible" => Ok(RetentionTier::ArchiveEligible),
            _ => Err(format!("Invalid retention tier: {}", s)),
        }
    }
}

/// Usage of the period that ended with a renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub billing_period: BillingPeriod,
    pub total_calls: i64,
    pub total_tokens: i64,
    pub total_cost_microcents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UsageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderUsage>>,
}

impl UsageSnapshot {
    pub fn is_compressed(&self) -> bool {
        self.status.is_none() && self.providers.is_none()
    }

    /// Keep the totals, drop the status and per-provider breakdown.
    pub fn compress(self) -> Self {
        Self {
            status: None,
            providers: None,
            ..self
        }
    }
}

impl From<&UsageSummary> for UsageSnapshot {
    fn from(summary: &UsageSummary) -> Self {
        Self {
            billing_period: summary.billing_period,
            total_calls: summary.total_calls,
            total_tokens: summary.total_tokens,
            total_cost_microcents: summary.total_cost_microcents,
            status: Some(summary.status),
            providers: Some(summary.providers.clone()),
        }
    }
}

/// Payment details of a renewal, retained for the life of the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    #[serde(default)]
    pub amount_microcents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Reference issued by the payment collaborator.
    #[serde(default)]
    pub reference: Option<String>,
}

/// Immutable audit of a subscription creation or renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalHistoryRecord {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Uuid,
    pub plan_id: String,
    pub previous_plan_id: Option<String>,
    pub renewal_type: RenewalType,
    pub previous_period_start: Option<DateTime<Utc>>,
    pub previous_period_end: Option<DateTime<Utc>>,
    pub new_period_start: DateTime<Utc>,
    pub new_period_end: DateTime<Utc>,
    pub usage_before_renewal: Option<UsageSnapshot>,
    pub retention_tier: RetentionTier,
    pub payment: PaymentMetadata,
    pub created_at: DateTime<Utc>,
}

/// Input for writing a renewal record.
#[derive(Debug, Clone)]
pub struct NewRenewalRecord {
    pub user_id: String,
    pub subscription_id: Uuid,
    pub plan_id: String,
    pub previous_plan_id: Option<String>,
    pub renewal_type: RenewalType,
    pub previous_period_start: Option<DateTime<Utc>>,
    pub previous_period_end: Option<DateTime<Utc>>,
    pub new_period_start: DateTime<Utc>,
    pub new_period_end: DateTime<Utc>,
    pub usage_before_renewal: Option<UsageSnapshot>,
    pub payment: PaymentMetadata,
    pub created_at: DateTime<Utc>,
}

/// Number of records per retention tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    pub full: i64,
    pub compressed: i64,
    pub nulled: i64,
    pub archive_eligible: i64,
}

impl RetentionStats {
    pub fn add(&mut self, tier: RetentionTier, count: i64) {
        match tier {
            RetentionTier::Full => self.full += count,
            RetentionTier::Compressed => self.compressed += count,
            RetentionTier::Nulled => self.nulled += count,
            RetentionTier::ArchiveEligible => self.archive_eligible += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.full + self.compressed + self.nulled + self.archive_eligible
    }
}

/// Whole calendar months elapsed from `from` to `to`, zero if `to` is earlier.
pub fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    if to <= from {
        return 0;
    }
    let mut months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    // The last month only counts once its day and time have been reached
    let to_in_month = (to.day(), to.num_seconds_from_midnight(), to.nanosecond());
    let from_in_month = (from.day(), from.num_seconds_from_midnight(), from.nanosecond());
    if to_in_month < from_in_month {
        months -= 1;
    }
    months.max(0) as u32
}

/// Exclusive upper bound on the instants at least `months` whole months
/// before `to`: `at < months_before(to, m)` exactly when
/// `months_between(at, to) >= m`.
pub fn months_before(to: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    let months = Months::new(months);
    match to.checked_sub_months(months) {
        // The same day and time exists in the target month
        Some(same) if same.day() == to.day() => Some(same + Duration::nanoseconds(1)),
        // Otherwise `to`'s day is past the end of the target month, so the
        // whole target month is far enough back
        _ => Utc
            .with_ymd_and_hms(to.year(), to.month(), 1, 0, 0, 0)
            .single()?
            .checked_sub_months(months)?
            .checked_add_months(Months::new(1)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::first_paid(0, false, 10, RenewalType::Upgrade)]
    #[case::first_free(0, false, 0, RenewalType::New)]
    #[case::same_tier(10, true, 10, RenewalType::Renewal)]
    #[case::up(0, true, 10, RenewalType::Upgrade)]
    #[case::down(20, true, 10, RenewalType::Downgrade)]
    fn test_classify(
        #[case] previous: i32,
        #[case] had_subscription: bool,
        #[case] new: i32,
        #[case] expected: RenewalType,
    ) {
        assert_eq!(RenewalType::classify(previous, had_subscription, new), expected);
    }

    #[rstest]
    #[case((2025, 1, 15), (2026, 1, 15), 12)]
    #[case((2025, 1, 15), (2026, 1, 14), 11)]
    #[case((2025, 1, 31), (2025, 3, 1), 1)]
    #[case((2024, 6, 1), (2026, 12, 1), 30)]
    #[case((2026, 1, 1), (2025, 1, 1), 0)]
    fn test_months_between(
        #[case] from: (i32, u32, u32),
        #[case] to: (i32, u32, u32),
        #[case] expected: u32,
    ) {
        let from = Utc.with_ymd_and_hms(from.0, from.1, from.2, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(to.0, to.1, to.2, 0, 0, 0).unwrap();
        assert_eq!(months_between(from, to), expected);
    }

    #[test]
    fn test_compress_keeps_totals() {
        let snapshot = UsageSnapshot {
            billing_period: BillingPeriod::new(2025, 1).unwrap(),
            total_calls: 4,
            total_tokens: 400,
            total_cost_microcents: 1_000,
            status: Some(UsageStatus::Warning),
            providers: Some(vec![ProviderUsage {
                provider: "openai".into(),
                calls: 4,
                tokens: 400,
                cost_microcents: 1_000,
            }]),
        };

        let compressed = RetentionTier::Compressed.degrade(Some(snapshot.clone())).unwrap();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.total_tokens, 400);
        assert_eq!(RetentionTier::Full.degrade(Some(snapshot.clone())), Some(snapshot.clone()));
        assert_eq!(RetentionTier::Nulled.degrade(Some(snapshot)), None);
    }

    #[test]
    fn test_tiers_are_ordered() {
        assert!(RetentionTier::Full < RetentionTier::Compressed);
        assert!(RetentionTier::Compressed < RetentionTier::Nulled);
        assert!(RetentionTier::Nulled < RetentionTier::ArchiveEligible);
    }

    #[rstest]
    #[case::same_day("2026-03-15T12:00:00Z", 12, "2025-03-15T12:00:00.000000001Z")]
    #[case::clamped_leap_day("2024-03-30T00:00:00Z", 1, "2024-03-01T00:00:00Z")]
    #[case::clamped_short_month("2025-05-31T08:00:00Z", 3, "2025-03-01T00:00:00Z")]
    #[case::leap_day_itself("2025-02-28T12:00:00Z", 12, "2024-02-28T12:00:00.000000001Z")]
    fn test_months_before(#[case] to: &str, #[case] months: u32, #[case] expected: &str) {
        let to: DateTime<Utc> = to.parse().unwrap();
        let expected: DateTime<Utc> = expected.parse().unwrap();
        assert_eq!(months_before(to, months), Some(expected));
    }

    #[test]
    fn test_months_before_agrees_with_months_between() {
        let start = Utc.with_ymd_and_hms(2023, 11, 1, 0, 0, 0).unwrap();
        let nows = [
            "2024-02-29T06:00:00Z",
            "2024-03-30T00:00:00Z",
            "2024-03-31T23:00:00Z",
            "2025-02-28T12:00:00Z",
            "2025-03-01T00:00:00Z",
        ];
        for now in nows {
            let now: DateTime<Utc> = now.parse().unwrap();
            for months in [1, 3, 12] {
                let cutoff = months_before(now, months).unwrap();
                // Every six hours across ~17 months
                for step in 0..(520 * 4) {
                    let at = start + Duration::hours(6 * step);
                    assert_eq!(
                        at < cutoff,
                        months_between(at, now) >= months,
                        "at={at} now={now} months={months}"
                    );
                }
            }
        }
    }
}
