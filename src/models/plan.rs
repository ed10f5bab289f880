use serde::{Deserialize, Serialize};

/// A quota on calls, tokens or cost.
///
/// Storage and config keep the historical convention where `0` means
/// "no limit"; in memory the two cases are distinct variants so a quota of
/// zero can never be confused with an unlimited one by accident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimit {
    #[default]
    Unlimited,
    Capped(i64),
}

impl UsageLimit {
    /// Decode a stored limit. Zero and negative values mean unlimited.
    pub fn from_stored(value: i64) -> Self {
        if value <= 0 {
            UsageLimit::Unlimited
        } else {
            UsageLimit::Capped(value)
        }
    }

    pub fn from_config(value: Option<i64>) -> Self {
        value.map(Self::from_stored).unwrap_or(UsageLimit::Unlimited)
    }

    pub fn to_stored(self) -> i64 {
        match self {
            UsageLimit::Unlimited => 0,
            UsageLimit::Capped(value) => value,
        }
    }

    pub fn cap(self) -> Option<i64> {
        match self {
            UsageLimit::Unlimited => None,
            UsageLimit::Capped(value) => Some(value),
        }
    }

    /// Whether `current + requested` stays within the limit.
    pub fn allows(self, current: i64, requested: i64) -> bool {
        match self {
            UsageLimit::Unlimited => true,
            UsageLimit::Capped(limit) => current.saturating_add(requested) <= limit,
        }
    }

    /// `max(0, limit - current)`, or `None` when unlimited.
    pub fn remaining(self, current: i64) -> Option<i64> {
        self.cap().map(|limit| limit.saturating_sub(current).max(0))
    }

    /// Share of the limit used, in percent. `None` when unlimited.
    pub fn percent_used(self, current: i64) -> Option<u32> {
        let limit = self.cap()?;
        let percent = (current.max(0) as i128 * 100) / limit as i128;
        Some(percent.min(u32::MAX as i128) as u32)
    }
}

impl std::fmt::Display for UsageLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageLimit::Unlimited => f.write_str("unlimited"),
            UsageLimit::Capped(value) => write!(f, "{value}"),
        }
    }
}

/// Limits a plan places on one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimit {
    pub provider: String,
    pub max_calls: UsageLimit,
    pub max_tokens: UsageLimit,
}

/// A named subscription tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    /// Ordinal rank; higher is a more expensive tier.
    pub tier_rank: i32,
    /// Monthly cost ceiling in microcents.
    pub monthly_cost_ceiling: UsageLimit,
    /// Per-provider limits, sorted by provider. Providers without an entry
    /// are unlimited.
    pub limits: Vec<ProviderLimit>,
}

impl SubscriptionPlan {
    pub fn limit_for(&self, provider: &str) -> Option<&ProviderLimit> {
        self.limits.iter().find(|l| l.provider == provider)
    }

    pub fn calls_limit(&self, provider: &str) -> UsageLimit {
        self.limit_for(provider)
            .map(|l| l.max_calls)
            .unwrap_or(UsageLimit::Unlimited)
    }

    pub fn tokens_limit(&self, provider: &str) -> UsageLimit {
        self.limit_for(provider)
            .map(|l| l.max_tokens)
            .unwrap_or(UsageLimit::Unlimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_unlimited() {
        assert_eq!(UsageLimit::from_stored(0), UsageLimit::Unlimited);
        assert_eq!(UsageLimit::from_config(None), UsageLimit::Unlimited);
        assert_eq!(UsageLimit::from_config(Some(0)), UsageLimit::Unlimited);
        assert_eq!(UsageLimit::Unlimited.to_stored(), 0);
        assert_eq!(UsageLimit::Unlimited.remaining(1_000_000), None);
        assert!(UsageLimit::Unlimited.allows(i64::MAX, 1));
    }

    #[test]
    fn test_remaining_never_negative() {
        let limit = UsageLimit::Capped(10);
        assert_eq!(limit.remaining(3), Some(7));
        assert_eq!(limit.remaining(10), Some(0));
        assert_eq!(limit.remaining(25), Some(0));
    }

    #[test]
    fn test_allows() {
        let limit = UsageLimit::Capped(10);
        assert!(limit.allows(9, 1));
        assert!(!limit.allows(10, 1));
        assert!(limit.allows(10, 0));
    }

    #[test]
    fn test_percent_used() {
        assert_eq!(UsageLimit::Capped(10).percent_used(8), Some(80));
        assert_eq!(UsageLimit::Capped(3).percent_used(4), Some(133));
        assert_eq!(UsageLimit::Unlimited.percent_used(8), None);
    }

    #[test]
    fn test_missing_provider_is_unlimited() {
        let plan = SubscriptionPlan {
            id: "free".into(),
            name: "Free".into(),
            tier_rank: 0,
            monthly_cost_ceiling: UsageLimit::Unlimited,
            limits: vec![ProviderLimit {
                provider: "openai".into(),
                max_calls: UsageLimit::Capped(10),
                max_tokens: UsageLimit::Unlimited,
            }],
        };
        assert_eq!(plan.calls_limit("openai"), UsageLimit::Capped(10));
        assert_eq!(plan.calls_limit("elevenlabs"), UsageLimit::Unlimited);
    }
}
