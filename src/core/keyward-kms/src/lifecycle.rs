//! Key state machine.
//!
//! ```text
//!                 import            disable
//! PendingImport ─────────▶ Enabled ◀───────▶ Disabled
//!       │                    │   enable          │
//!       │                    ▼                   │
//!       └──────────▶ PendingDeletion ◀───────────┘
//!                    (or PendingReplicaDeletion for a primary with replicas)
//!                          │ cancel ──▶ Disabled
//!                          ▼
//!                       (deleted)
//! ```
//!
//! Every function here mutates a [`Key`] in memory and reports whether the
//! transition is legal; persisting the result is the caller's job, inside
//! the operation's transaction.

use tracing::info;

use crate::config::{KmsConfig, SECONDS_PER_DAY};
use crate::error::KmsError;
use crate::model::{ExpirationModel, Key, KeyState, MultiRegionConfig, MultiRegionKeyType, Origin};

/// Accepted waiting period for ScheduleKeyDeletion, in days.
pub const PENDING_WINDOW_DAYS: std::ops::RangeInclusive<u32> = 7..=30;

fn invalid_state(key: &Key, action: &str) -> KmsError {
    KmsError::InvalidState(format!(
        "cannot {action} key {} while it is {}",
        key.key_id, key.state
    ))
}

/// State-machine rules parameterized by configuration.
#[derive(Debug, Clone)]
pub struct KeyLifecycleManager {
    default_pending_window_days: u32,
    default_rotation_period_days: u32,
    rotation_bounds: std::ops::RangeInclusive<u32>,
}

impl KeyLifecycleManager {
    /// Creates a manager from the engine configuration.
    pub fn new(config: &KmsConfig) -> Self {
        Self {
            default_pending_window_days: config.default_pending_window_days,
            default_rotation_period_days: config.default_rotation_period_days,
            rotation_bounds: config.min_rotation_period_days..=config.max_rotation_period_days,
        }
    }

    // ========================================================================
    // Enable / disable
    // ========================================================================

    /// `Disabled → Enabled`. Enabling an enabled key is a no-op.
    pub fn enable(&self, key: &mut Key) -> Result<(), KmsError> {
        match key.state {
            KeyState::Enabled | KeyState::Disabled => {
                key.state = KeyState::Enabled;
                Ok(())
            },
            _ => Err(invalid_state(key, "enable")),
        }
    }

    /// `Enabled → Disabled`. Disabling a disabled key is a no-op.
    pub fn disable(&self, key: &mut Key) -> Result<(), KmsError> {
        match key.state {
            KeyState::Enabled | KeyState::Disabled => {
                key.state = KeyState::Disabled;
                Ok(())
            },
            _ => Err(invalid_state(key, "disable")),
        }
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Schedules deletion after `days` (default from configuration).
    ///
    /// A primary that still has replicas waits in `PendingReplicaDeletion`
    /// with no deletion date until the last replica is gone.
    pub fn schedule_deletion(
        &self,
        key: &mut Key,
        days: Option<u32>,
        now: u64,
    ) -> Result<(), KmsError> {
        let days = days.unwrap_or(self.default_pending_window_days);
        if !PENDING_WINDOW_DAYS.contains(&days) {
            return Err(KmsError::Validation(format!(
                "PendingWindowInDays must be between 7 and 30, got {days}"
            )));
        }
        match key.state {
            KeyState::Enabled | KeyState::Disabled | KeyState::PendingImport => {},
            _ => return Err(invalid_state(key, "schedule deletion of")),
        }

        key.pending_window_days = Some(days);
        if key.is_primary() && !key.replica_regions().is_empty() {
            key.state = KeyState::PendingReplicaDeletion;
            key.deletion_date = None;
        } else {
            key.state = KeyState::PendingDeletion;
            key.deletion_date = Some(now + u64::from(days) * SECONDS_PER_DAY);
        }
        Ok(())
    }

    /// Cancels a scheduled deletion; the key comes back `Disabled`.
    pub fn cancel_deletion(&self, key: &mut Key) -> Result<(), KmsError> {
        match key.state {
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion => {
                key.state = KeyState::Disabled;
                key.deletion_date = None;
                key.pending_window_days = None;
                Ok(())
            },
            _ => Err(invalid_state(key, "cancel deletion of")),
        }
    }

    /// Whether the waiting period of a key has elapsed.
    pub fn deletion_due(&self, key: &Key, now: u64) -> bool {
        key.state == KeyState::PendingDeletion && key.deletion_date.is_some_and(|d| d <= now)
    }

    /// Moves a primary whose last replica is gone from
    /// `PendingReplicaDeletion` to `PendingDeletion`.
    pub fn replicas_gone(&self, key: &mut Key, now: u64) {
        if key.state == KeyState::PendingReplicaDeletion && key.replica_regions().is_empty() {
            let days = key.pending_window_days.unwrap_or(self.default_pending_window_days);
            key.state = KeyState::PendingDeletion;
            key.deletion_date = Some(now + u64::from(days) * SECONDS_PER_DAY);
            info!(key_id = %key.key_id, "Last replica deleted, primary deletion scheduled");
        }
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    fn check_rotation_target(&self, key: &Key) -> Result<(), KmsError> {
        if !key.rotation_eligible() {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} ({}, origin {}) does not support rotation",
                key.key_id, key.key_spec, key.origin
            )));
        }
        if key.is_replica() {
            return Err(KmsError::UnsupportedOperation(format!(
                "rotation of replica {} is managed by its primary",
                key.key_id
            )));
        }
        Ok(())
    }

    /// Turns on automatic rotation.
    pub fn enable_rotation(
        &self,
        key: &mut Key,
        period_days: Option<u32>,
        now: u64,
    ) -> Result<(), KmsError> {
        self.check_rotation_target(key)?;
        if key.state != KeyState::Enabled {
            return Err(invalid_state(key, "enable rotation of"));
        }
        let period = period_days.unwrap_or(self.default_rotation_period_days);
        if !self.rotation_bounds.contains(&period) {
            return Err(KmsError::Validation(format!(
                "RotationPeriodInDays must be between {} and {}, got {period}",
                self.rotation_bounds.start(),
                self.rotation_bounds.end()
            )));
        }

        key.rotation.enabled = true;
        key.rotation.period_days = Some(period);
        let anchor = key.rotation.last_rotation.unwrap_or(key.created_at).max(now);
        key.rotation.next_rotation = Some(anchor + u64::from(period) * SECONDS_PER_DAY);
        Ok(())
    }

    /// Turns off automatic rotation.
    pub fn disable_rotation(&self, key: &mut Key) -> Result<(), KmsError> {
        self.check_rotation_target(key)?;
        if key.state != KeyState::Enabled {
            return Err(invalid_state(key, "disable rotation of"));
        }
        key.rotation.enabled = false;
        key.rotation.next_rotation = None;
        Ok(())
    }

    /// Advances the key to a new version; returns the version number.
    pub fn rotate(&self, key: &mut Key, now: u64) -> Result<u32, KmsError> {
        self.check_rotation_target(key)?;
        if !matches!(key.state, KeyState::Enabled | KeyState::Updating) {
            return Err(invalid_state(key, "rotate"));
        }
        self.advance_version(key, now);
        Ok(key.current_version)
    }

    /// Records a new current version and reschedules automatic rotation.
    /// Replicas follow their primary through this as well.
    pub fn advance_version(&self, key: &mut Key, now: u64) {
        key.current_version += 1;
        key.rotation.last_rotation = Some(now);
        if key.rotation.enabled {
            let period = key
                .rotation
                .period_days
                .unwrap_or(self.default_rotation_period_days);
            key.rotation.next_rotation = Some(now + u64::from(period) * SECONDS_PER_DAY);
        }
    }

    /// Whether scheduled rotation is due.
    pub fn rotation_due(&self, key: &Key, now: u64) -> bool {
        key.state == KeyState::Enabled
            && !key.is_replica()
            && key.rotation.enabled
            && key.rotation.next_rotation.is_some_and(|t| t <= now)
    }

    // ========================================================================
    // Imported material
    // ========================================================================

    /// Applies imported material identified by `fingerprint`.
    ///
    /// The first import binds the key to that material; later imports must
    /// carry the same material and only refresh the expiration settings.
    /// Returns `true` when this was the first import.
    pub fn import_material(
        &self,
        key: &mut Key,
        fingerprint: &str,
        expiration_model: Option<ExpirationModel>,
        valid_to: Option<u64>,
        now: u64,
    ) -> Result<bool, KmsError> {
        if key.origin != Origin::External {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} does not accept imported material",
                key.key_id
            )));
        }
        if matches!(key.state, KeyState::PendingDeletion | KeyState::PendingReplicaDeletion) {
            return Err(invalid_state(key, "import material into"));
        }
        if let Some(existing) = &key.material_fingerprint {
            if existing != fingerprint {
                return Err(KmsError::IncorrectKeyMaterial(format!(
                    "key {} was created with different key material",
                    key.key_id
                )));
            }
        }

        let model = expiration_model.unwrap_or(if valid_to.is_some() {
            ExpirationModel::KeyMaterialExpires
        } else {
            ExpirationModel::KeyMaterialDoesNotExpire
        });
        let valid_to = match model {
            ExpirationModel::KeyMaterialExpires => {
                let valid_to = valid_to.ok_or_else(|| {
                    KmsError::Validation("ValidTo is required when material expires".into())
                })?;
                if valid_to <= now {
                    return Err(KmsError::Validation("ValidTo must be in the future".into()));
                }
                Some(valid_to)
            },
            ExpirationModel::KeyMaterialDoesNotExpire => {
                if valid_to.is_some() {
                    return Err(KmsError::Validation(
                        "ValidTo is not allowed with KEY_MATERIAL_DOES_NOT_EXPIRE".into(),
                    ));
                }
                None
            },
        };

        let first = key.material_fingerprint.is_none();
        key.material_fingerprint = Some(fingerprint.to_string());
        key.expiration_model = Some(model);
        key.valid_to = valid_to;
        if first {
            key.current_version = 1;
        }
        if key.state == KeyState::PendingImport {
            key.state = KeyState::Enabled;
        }
        Ok(first)
    }

    /// Drops the key's usable material; the key waits for a reimport.
    pub fn delete_imported_material(&self, key: &mut Key) -> Result<(), KmsError> {
        if key.origin != Origin::External {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} has no imported material",
                key.key_id
            )));
        }
        match key.state {
            KeyState::Enabled | KeyState::Disabled | KeyState::PendingImport => {
                key.state = KeyState::PendingImport;
            },
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion => {},
            KeyState::Updating => return Err(invalid_state(key, "delete material of")),
        }
        key.valid_to = None;
        key.expiration_model = None;
        Ok(())
    }

    /// Whether imported material has reached its expiry.
    pub fn material_expired(&self, key: &Key, now: u64) -> bool {
        key.origin == Origin::External
            && matches!(key.state, KeyState::Enabled | KeyState::Disabled)
            && key.expiration_model == Some(ExpirationModel::KeyMaterialExpires)
            && key.valid_to.is_some_and(|t| t <= now)
    }

    // ========================================================================
    // Multi-Region
    // ========================================================================

    /// Builds the replica record of `primary` in `region` and registers the
    /// region on the primary.
    pub fn replicate(
        &self,
        primary: &mut Key,
        region: &str,
        description: Option<String>,
        now: u64,
    ) -> Result<Key, KmsError> {
        if !primary.is_primary() {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} is not a multi-Region primary key",
                primary.key_id
            )));
        }
        if primary.state != KeyState::Enabled {
            return Err(invalid_state(primary, "replicate"));
        }
        if region.is_empty() || region.contains(['/', ':']) {
            return Err(KmsError::Validation(format!("invalid region: {region}")));
        }
        if region == primary.region || primary.replica_regions().iter().any(|r| r == region) {
            return Err(KmsError::AlreadyExists(format!(
                "key {} already exists in {region}",
                primary.key_id
            )));
        }

        if let Some(mr) = primary.multi_region.as_mut() {
            mr.replica_regions.push(region.to_string());
            mr.replica_regions.sort();
        }

        Ok(Key {
            region: region.to_string(),
            description: description.unwrap_or_else(|| primary.description.clone()),
            state: KeyState::Enabled,
            created_at: now,
            deletion_date: None,
            pending_window_days: None,
            multi_region: Some(MultiRegionConfig {
                role: MultiRegionKeyType::Replica,
                primary_region: primary.region.clone(),
                replica_regions: Vec::new(),
            }),
            pending_primary_region: None,
            ..primary.clone()
        })
    }

    /// First phase of a primary-region transfer: both records enter
    /// `Updating` and remember the target.
    pub fn begin_primary_update(
        &self,
        primary: &mut Key,
        replica: &mut Key,
    ) -> Result<(), KmsError> {
        if !primary.is_primary() {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} is not a multi-Region primary key",
                primary.key_id
            )));
        }
        if !replica.is_replica() || replica.key_id != primary.key_id {
            return Err(KmsError::NotFound(format!(
                "no replica of {} in {}",
                primary.key_id, replica.region
            )));
        }
        if primary.state != KeyState::Enabled {
            return Err(invalid_state(primary, "update the primary region of"));
        }
        if replica.state != KeyState::Enabled {
            return Err(invalid_state(replica, "promote"));
        }

        let target = replica.region.clone();
        for key in [&mut *primary, &mut *replica] {
            key.state = KeyState::Updating;
            key.pending_primary_region = Some(target.clone());
        }
        Ok(())
    }

    /// Second phase: swap roles and topology, then return both to `Enabled`.
    ///
    /// `others` are the remaining replicas, whose primary pointer moves.
    pub fn complete_primary_update(
        &self,
        old_primary: &mut Key,
        new_primary: &mut Key,
        others: &mut [Key],
    ) {
        let old_region = old_primary.region.clone();
        let new_region = new_primary.region.clone();

        let mut replicas: Vec<String> = old_primary
            .replica_regions()
            .iter()
            .filter(|r| **r != new_region)
            .cloned()
            .collect();
        replicas.push(old_region.clone());
        replicas.sort();

        new_primary.multi_region = Some(MultiRegionConfig {
            role: MultiRegionKeyType::Primary,
            primary_region: new_region.clone(),
            replica_regions: replicas,
        });
        new_primary.rotation = old_primary.rotation.clone();
        new_primary.current_version = old_primary.current_version;

        old_primary.multi_region = Some(MultiRegionConfig {
            role: MultiRegionKeyType::Replica,
            primary_region: new_region.clone(),
            replica_regions: Vec::new(),
        });

        for key in [&mut *old_primary, &mut *new_primary] {
            key.state = KeyState::Enabled;
            key.pending_primary_region = None;
        }
        for other in others {
            if let Some(mr) = other.multi_region.as_mut() {
                mr.primary_region = new_region.clone();
            }
        }
        info!(
            key_id = %new_primary.key_id,
            from = %old_region,
            to = %new_region,
            "Primary region updated"
        );
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::model::{KeySpec, KeyUsage, RotationSettings};

    const DAY: u64 = SECONDS_PER_DAY;

    fn manager() -> KeyLifecycleManager {
        KeyLifecycleManager::new(&KmsConfig::default())
    }

    fn key(state: KeyState) -> Key {
        Key {
            key_id: "k1".into(),
            region: "us-east-1".into(),
            account_id: "111122223333".into(),
            description: String::new(),
            key_spec: KeySpec::SymmetricDefault,
            key_usage: KeyUsage::EncryptDecrypt,
            origin: Origin::ServiceGenerated,
            custom_key_store_id: None,
            state,
            created_at: 0,
            deletion_date: None,
            pending_window_days: None,
            rotation: RotationSettings::default(),
            expiration_model: None,
            valid_to: None,
            multi_region: None,
            current_version: 1,
            material_fingerprint: None,
            pending_primary_region: None,
        }
    }

    fn primary() -> Key {
        Key {
            key_id: "mrk-1".into(),
            multi_region: Some(MultiRegionConfig {
                role: MultiRegionKeyType::Primary,
                primary_region: "us-east-1".into(),
                replica_regions: vec![],
            }),
            ..key(KeyState::Enabled)
        }
    }

    #[test]
    fn test_enable_disable_transitions() {
        let lm = manager();
        let mut k = key(KeyState::Enabled);
        lm.disable(&mut k).unwrap();
        assert_eq!(k.state, KeyState::Disabled);
        lm.disable(&mut k).unwrap();
        lm.enable(&mut k).unwrap();
        assert_eq!(k.state, KeyState::Enabled);

        for state in [KeyState::PendingDeletion, KeyState::PendingImport, KeyState::PendingReplicaDeletion] {
            let mut k = key(state);
            assert!(matches!(lm.enable(&mut k), Err(KmsError::InvalidState(_))));
            assert!(matches!(lm.disable(&mut k), Err(KmsError::InvalidState(_))));
            assert_eq!(k.state, state);
        }
    }

    #[test]
    fn test_schedule_and_cancel_deletion() {
        let lm = manager();
        let mut k = key(KeyState::Enabled);
        assert!(matches!(
            lm.schedule_deletion(&mut k, Some(6), 0),
            Err(KmsError::Validation(_))
        ));
        assert!(lm.schedule_deletion(&mut k, Some(31), 0).is_err());

        lm.schedule_deletion(&mut k, Some(7), 100).unwrap();
        assert_eq!(k.state, KeyState::PendingDeletion);
        assert_eq!(k.deletion_date, Some(100 + 7 * DAY));
        assert!(!lm.deletion_due(&k, 100 + 7 * DAY - 1));
        assert!(lm.deletion_due(&k, 100 + 7 * DAY));
        assert!(lm.schedule_deletion(&mut k, Some(7), 100).is_err());

        lm.cancel_deletion(&mut k).unwrap();
        assert_eq!(k.state, KeyState::Disabled);
        assert_eq!(k.deletion_date, None);
        assert!(lm.cancel_deletion(&mut k).is_err());

        let mut k = key(KeyState::Enabled);
        lm.schedule_deletion(&mut k, None, 0).unwrap();
        assert_eq!(k.deletion_date, Some(30 * DAY));
    }

    #[test]
    fn test_primary_with_replicas_waits_for_them() {
        let lm = manager();
        let mut p = primary();
        lm.replicate(&mut p, "eu-west-1", None, 0).unwrap();
        lm.schedule_deletion(&mut p, Some(10), 0).unwrap();
        assert_eq!(p.state, KeyState::PendingReplicaDeletion);
        assert_eq!(p.deletion_date, None);

        lm.replicas_gone(&mut p, 50);
        assert_eq!(p.state, KeyState::PendingReplicaDeletion);

        if let Some(mr) = p.multi_region.as_mut() {
            mr.replica_regions.clear();
        }
        lm.replicas_gone(&mut p, 50);
        assert_eq!(p.state, KeyState::PendingDeletion);
        assert_eq!(p.deletion_date, Some(50 + 10 * DAY));
    }

    #[test]
    fn test_rotation_rules() {
        let lm = manager();
        let mut k = key(KeyState::Enabled);
        assert!(lm.enable_rotation(&mut k, Some(89), 0).is_err());
        assert!(lm.enable_rotation(&mut k, Some(2561), 0).is_err());
        lm.enable_rotation(&mut k, Some(90), 10).unwrap();
        assert_eq!(k.rotation.next_rotation, Some(10 + 90 * DAY));
        assert!(!lm.rotation_due(&k, 10 + 90 * DAY - 1));
        assert!(lm.rotation_due(&k, 10 + 90 * DAY));

        assert_eq!(lm.rotate(&mut k, 20).unwrap(), 2);
        assert_eq!(k.rotation.last_rotation, Some(20));
        assert_eq!(k.rotation.next_rotation, Some(20 + 90 * DAY));

        lm.disable_rotation(&mut k).unwrap();
        assert!(!lm.rotation_due(&k, u64::MAX));

        let mut rsa = Key {
            key_spec: KeySpec::Rsa2048,
            ..key(KeyState::Enabled)
        };
        assert!(matches!(
            lm.enable_rotation(&mut rsa, None, 0),
            Err(KmsError::UnsupportedOperation(_))
        ));
        let mut external = Key {
            origin: Origin::External,
            ..key(KeyState::Enabled)
        };
        assert!(lm.rotate(&mut external, 0).is_err());
        let mut disabled = key(KeyState::Disabled);
        assert!(matches!(lm.rotate(&mut disabled, 0), Err(KmsError::InvalidState(_))));
    }

    #[test]
    fn test_import_rules() {
        let lm = manager();
        let mut k = Key {
            origin: Origin::External,
            current_version: 0,
            ..key(KeyState::PendingImport)
        };

        assert!(lm
            .import_material(&mut k, "fp-a", Some(ExpirationModel::KeyMaterialExpires), None, 0)
            .is_err());
        assert!(lm.import_material(&mut k, "fp-a", None, Some(5), 10).is_err());

        assert!(lm.import_material(&mut k, "fp-a", None, None, 0).unwrap());
        assert_eq!(k.state, KeyState::Enabled);
        assert_eq!(k.current_version, 1);

        assert!(!lm.import_material(&mut k, "fp-a", None, Some(500), 10).unwrap());
        assert_eq!(k.expiration_model, Some(ExpirationModel::KeyMaterialExpires));
        assert!(lm.material_expired(&k, 500));

        assert!(matches!(
            lm.import_material(&mut k, "fp-b", None, None, 10),
            Err(KmsError::IncorrectKeyMaterial(_))
        ));

        lm.delete_imported_material(&mut k).unwrap();
        assert_eq!(k.state, KeyState::PendingImport);
        assert!(!lm.material_expired(&k, 500));
        assert!(lm.import_material(&mut k, "fp-b", None, None, 10).is_err());
        lm.import_material(&mut k, "fp-a", None, None, 10).unwrap();
        assert_eq!(k.state, KeyState::Enabled);

        let mut own = key(KeyState::Enabled);
        assert!(matches!(
            lm.import_material(&mut own, "fp", None, None, 0),
            Err(KmsError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_replicate_and_swap_primary() {
        let lm = manager();
        let mut p = primary();
        lm.enable_rotation(&mut p, Some(100), 0).unwrap();

        let mut west = lm.replicate(&mut p, "eu-west-1", None, 5).unwrap();
        let mut south = lm.replicate(&mut p, "ap-south-1", None, 5).unwrap();
        assert!(west.is_replica());
        assert_eq!(west.key_id, p.key_id);
        assert_eq!(p.replica_regions(), &["ap-south-1".to_string(), "eu-west-1".to_string()]);
        assert!(matches!(
            lm.replicate(&mut p, "eu-west-1", None, 5),
            Err(KmsError::AlreadyExists(_))
        ));
        assert!(lm.replicate(&mut west, "us-west-2", None, 5).is_err());

        lm.begin_primary_update(&mut p, &mut west).unwrap();
        assert_eq!(p.state, KeyState::Updating);
        assert_eq!(west.state, KeyState::Updating);
        assert_eq!(p.pending_primary_region.as_deref(), Some("eu-west-1"));
        assert_eq!(west.pending_primary_region.as_deref(), Some("eu-west-1"));

        lm.complete_primary_update(&mut p, &mut west, std::slice::from_mut(&mut south));
        assert!(west.is_primary());
        assert!(p.is_replica());
        assert_eq!(west.replica_regions(), &["ap-south-1".to_string(), "us-east-1".to_string()]);
        assert_eq!(south.multi_region.unwrap().primary_region, "eu-west-1");
        assert_eq!(west.rotation.period_days, Some(100));
        assert_eq!(p.state, KeyState::Enabled);
        assert_eq!(west.pending_primary_region, None);
    }
}
