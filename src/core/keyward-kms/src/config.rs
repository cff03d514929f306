//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KmsError;

/// Seconds in a day; waiting periods and rotation periods are given in days.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Hard ceiling for any `Limit` parameter.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Configuration of one regional engine.
///
/// Built explicitly by the embedding process and handed to
/// [`Kms::new`](crate::Kms::new). Every field has a default, so partial JSON
/// documents deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// ARN partition.
    pub partition: String,
    /// Region served by this engine.
    pub region: String,
    /// Owning account (12 digits).
    pub account_id: String,
    /// Seconds before a grant referenced by ID alone becomes visible.
    pub grant_propagation_delay_secs: u64,
    /// Grants allowed per key.
    pub max_grants_per_key: usize,
    /// Keys allowed per region.
    pub max_keys: usize,
    /// Aliases allowed per region.
    pub max_aliases: usize,
    /// Tags allowed per key.
    pub max_tags_per_key: usize,
    /// Waiting period applied when ScheduleKeyDeletion omits one.
    pub default_pending_window_days: u32,
    /// Rotation period applied when EnableKeyRotation omits one.
    pub default_rotation_period_days: u32,
    /// Shortest accepted rotation period.
    pub min_rotation_period_days: u32,
    /// Longest accepted rotation period.
    pub max_rotation_period_days: u32,
    /// Lifetime of an import token.
    pub import_token_validity_secs: u64,
    /// Deadline for each storage call.
    pub storage_timeout_ms: u64,
    /// Page size used when a list request has no `Limit`.
    pub list_page_size: usize,
    /// Period of the background maintenance loop.
    pub maintenance_interval_secs: u64,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            partition: "keyward".to_string(),
            region: "us-east-1".to_string(),
            account_id: "111122223333".to_string(),
            grant_propagation_delay_secs: 180,
            max_grants_per_key: 50_000,
            max_keys: 100_000,
            max_aliases: 100_000,
            max_tags_per_key: 50,
            default_pending_window_days: 30,
            default_rotation_period_days: 365,
            min_rotation_period_days: 90,
            max_rotation_period_days: 2560,
            import_token_validity_secs: 24 * 3600,
            storage_timeout_ms: 5_000,
            list_page_size: 100,
            maintenance_interval_secs: 60,
        }
    }
}

impl KmsConfig {
    /// Convenience constructor for a region with otherwise default settings.
    pub fn for_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), KmsError> {
        if self.partition.is_empty() || self.partition.contains(':') {
            return Err(KmsError::Validation("partition must be a non-empty ARN segment".into()));
        }
        if self.region.is_empty() || self.region.contains(['/', ':']) {
            return Err(KmsError::Validation("region must be a non-empty ARN segment".into()));
        }
        if self.account_id.len() != 12 || !self.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(KmsError::Validation("account id must be 12 digits".into()));
        }
        if !(7..=30).contains(&self.default_pending_window_days) {
            return Err(KmsError::Validation(
                "default pending window must be between 7 and 30 days".into(),
            ));
        }
        if self.min_rotation_period_days == 0
            || self.min_rotation_period_days > self.max_rotation_period_days
            || !(self.min_rotation_period_days..=self.max_rotation_period_days)
                .contains(&self.default_rotation_period_days)
        {
            return Err(KmsError::Validation("inconsistent rotation period bounds".into()));
        }
        if self.list_page_size == 0 || self.list_page_size > MAX_PAGE_SIZE {
            return Err(KmsError::Validation(format!(
                "list page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.storage_timeout_ms == 0 {
            return Err(KmsError::Validation("storage timeout must be positive".into()));
        }
        Ok(())
    }

    /// Storage deadline as a [`Duration`].
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Maintenance period as a [`Duration`].
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    /// Resolves a caller-supplied `Limit`.
    pub fn page_limit(&self, limit: Option<usize>) -> Result<usize, KmsError> {
        match limit {
            None => Ok(self.list_page_size),
            Some(n) if (1..=MAX_PAGE_SIZE).contains(&n) => Ok(n),
            Some(n) => Err(KmsError::Validation(format!(
                "limit {n} outside 1..={MAX_PAGE_SIZE}"
            ))),
        }
    }

    /// Principal ARN of the owning account's root.
    pub fn root_principal(&self) -> String {
        format!("arn:{}:iam::{}:root", self.partition, self.account_id)
    }
}
