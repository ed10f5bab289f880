//! Historical data maintenance configuration.
//!
//! Two sweeps keep per-user history bounded: audit-log compaction and
//! renewal-history retention tiers. Both run opportunistically when the
//! corresponding data is read, never on a timer.
//!
//! # Example
//!
//! ```toml
//! [compaction]
//! threshold = 1000
//! keep_recent = 100
//!
//! [retention]
//! compressed_after_months = 12
//! nulled_after_months = 24
//! archive_after_months = 84
//! ```

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::RetentionTier;

/// Audit-log compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct CompactionConfig {
    /// Whether compaction runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Raw rows a user may accumulate before compaction kicks in.
    /// Default: 1000
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Most recent raw rows left untouched by a compaction run.
    /// Default: 100
    #[serde(default = "default_keep_recent")]
    pub keep_recent: u32,

    /// Trigger compaction when current usage is read.
    #[serde(default = "default_true")]
    pub sweep_on_read: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            keep_recent: default_keep_recent(),
            sweep_on_read: true,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_recent >= self.threshold {
            return Err(ConfigError::Validation(format!(
                "compaction.keep_recent ({}) must be lower than compaction.threshold ({})",
                self.keep_recent, self.threshold
            )));
        }
        Ok(())
    }
}

fn default_threshold() -> u32 {
    1000
}

fn default_keep_recent() -> u32 {
    100
}

/// Renewal-history retention tiers, expressed as record age in months.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Whether retention tiers are applied at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Age at which usage snapshots are reduced to their totals.
    /// Default: 12
    #[serde(default = "default_compressed_after")]
    pub compressed_after_months: u32,

    /// Age at which usage snapshots are removed.
    /// Default: 24
    #[serde(default = "default_nulled_after")]
    pub nulled_after_months: u32,

    /// Age at which records are flagged as archive-eligible.
    /// Default: 84
    #[serde(default = "default_archive_after")]
    pub archive_after_months: u32,

    /// Trigger a retention pass when renewal history is read.
    #[serde(default = "default_true")]
    pub sweep_on_read: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compressed_after_months: default_compressed_after(),
            nulled_after_months: default_nulled_after(),
            archive_after_months: default_archive_after(),
            sweep_on_read: true,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compressed_after_months == 0
            || self.compressed_after_months >= self.nulled_after_months
            || self.nulled_after_months >= self.archive_after_months
        {
            return Err(ConfigError::Validation(
                "retention tiers must satisfy 0 < compressed_after_months < \
                 nulled_after_months < archive_after_months"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Tier for a record that is `age_months` whole months old.
    pub fn tier_for_age(&self, age_months: u32) -> RetentionTier {
        if age_months >= self.archive_after_months {
            RetentionTier::ArchiveEligible
        } else if age_months >= self.nulled_after_months {
            RetentionTier::Nulled
        } else if age_months >= self.compressed_after_months {
            RetentionTier::Compressed
        } else {
            RetentionTier::Full
        }
    }
}

fn default_compressed_after() -> u32 {
    12
}

fn default_nulled_after() -> u32 {
    24
}

fn default_archive_after() -> u32 {
    84
}

fn default_true() -> bool {
    true
}
