//! The KMS facade.
//!
//! Every operation opens one [`Txn`], resolves the key, gates on its state,
//! authorizes, then hands off to the lifecycle rules or the crypto engine.
//! Mutations commit once at the end; cryptographic operations only read, so
//! they never commit and never contend with each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use keyward_crypto::{KeyMaterial, MasterKey};
use keyward_storage::StorageBackend;

use crate::clock::Clock;
use crate::config::KmsConfig;
use crate::engine;
use crate::error::KmsError;
use crate::grants::{GrantFilter, GrantRegistry, NewGrant, RetireTarget};
use crate::import::{self, ImportManager};
use crate::lifecycle::KeyLifecycleManager;
use crate::model::{
    alias_arn, key_arn, new_key_id, principal_account, validate_alias_name, validate_tag, Alias,
    EncryptionAlgorithm, EncryptionContext, Grant, GrantConstraints, Key, KeyRef, KeySpec,
    KeyState, KeyUsage, KeyVersion, MessageType, MultiRegionConfig, MultiRegionKeyType, Operation,
    Origin, RotationSettings, RotationType, Tag,
};
use crate::page::paginate;
use crate::policy::{
    default_key_policy, Authorization, AuthorizationInput, PolicyDocument, PolicyEvaluator,
    PolicyKind, RequestContext, DEFAULT_POLICY_NAME,
};
use crate::requests::*;
use crate::store::{KeyStore, Txn};

const MAX_DESCRIPTION_LEN: usize = 8192;

/// Authenticated identity of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    principal: String,
}

impl Caller {
    /// Wraps a principal ARN supplied by the transport.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    /// Principal ARN.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Account the principal belongs to.
    pub fn account(&self) -> Option<&str> {
        principal_account(&self.principal)
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Keys physically deleted.
    pub deleted: usize,
    /// Keys rotated on schedule.
    pub rotated: usize,
    /// Keys whose imported material expired.
    pub expired: usize,
    /// Interrupted primary-region updates completed.
    pub promoted: usize,
    /// Keys skipped because of an error; retried next pass.
    pub failed: usize,
}

/// One regional KMS engine.
pub struct Kms {
    config: Arc<KmsConfig>,
    clock: Arc<dyn Clock>,
    store: KeyStore,
    grants: GrantRegistry,
    evaluator: PolicyEvaluator,
    lifecycle: KeyLifecycleManager,
    imports: ImportManager,
}

impl Kms {
    /// Builds an engine over `backend`.
    ///
    /// Engines for different regions may share one backend and master key;
    /// multi-Region keys rely on that.
    pub fn new(
        config: KmsConfig,
        backend: Arc<dyn StorageBackend>,
        master_key: MasterKey,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KmsError> {
        config.validate()?;

        let grants = GrantRegistry::new(&master_key, &config)?;
        let imports = ImportManager::new(&master_key, &config)?;
        let evaluator = PolicyEvaluator::new(config.root_principal());
        let lifecycle = KeyLifecycleManager::new(&config);
        let store = KeyStore::new(
            backend,
            master_key,
            config.region.clone(),
            config.storage_timeout(),
        );

        info!(
            region = %config.region,
            account = %config.account_id,
            "KMS engine initialized"
        );
        Ok(Self {
            config: Arc::new(config),
            clock,
            store,
            grants,
            evaluator,
            lifecycle,
            imports,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    /// Region served.
    pub fn region(&self) -> &str {
        self.store.region()
    }

    /// The owning account's root principal.
    pub fn root_caller(&self) -> Caller {
        Caller::new(self.config.root_principal())
    }

    fn now(&self) -> u64 {
        self.clock.now()
    }

    fn arn(&self, key: &Key) -> String {
        key.arn(&self.config.partition)
    }

    // ========================================================================
    // Resolution and authorization
    // ========================================================================

    async fn resolve(&self, txn: &mut Txn<'_>, key_ref: &str) -> Result<Key, KmsError> {
        let parsed = KeyRef::parse(key_ref)?;
        if let Some(region) = parsed.region() {
            if region != self.region() {
                return Err(KmsError::NotFound(format!(
                    "{key_ref} is not in region {}",
                    self.region()
                )));
            }
        }
        let key_id = match parsed {
            KeyRef::Id { key_id, .. } => key_id,
            KeyRef::Alias { name, .. } => {
                txn.get_alias(&name)
                    .await?
                    .ok_or_else(|| KmsError::NotFound(format!("alias {name} does not exist")))?
                    .target_key_id
            },
        };
        txn.require_key(&key_id).await
    }

    /// Whether the key's material may be used right now.
    fn check_usable(&self, key: &Key) -> Result<(), KmsError> {
        match key.state {
            KeyState::Enabled | KeyState::Updating => {},
            KeyState::Disabled => {
                return Err(KmsError::Disabled(format!("key {} is disabled", key.key_id)));
            },
            KeyState::PendingImport => {
                return Err(KmsError::KeyUnavailable(format!(
                    "key {} has no key material",
                    key.key_id
                )));
            },
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion => {
                return Err(KmsError::InvalidState(format!(
                    "key {} is pending deletion",
                    key.key_id
                )));
            },
        }
        if self.lifecycle.material_expired(key, self.now()) {
            return Err(KmsError::KeyUnavailable(format!(
                "imported key material of {} has expired",
                key.key_id
            )));
        }
        Ok(())
    }

    async fn identity_policies(
        &self,
        txn: &mut Txn<'_>,
        principal: &str,
    ) -> Result<Vec<PolicyDocument>, KmsError> {
        txn.identity_policies(principal)
            .await?
            .iter()
            .map(|doc| PolicyDocument::parse(doc, PolicyKind::Identity))
            .collect()
    }

    async fn key_policy(&self, txn: &mut Txn<'_>, key: &Key) -> Result<PolicyDocument, KmsError> {
        match txn.get_policy(&key.key_id).await? {
            Some(doc) => PolicyDocument::parse(&doc, PolicyKind::Key),
            None => Ok(default_key_policy(&self.config.root_principal())),
        }
    }

    async fn authorize_account(
        &self,
        txn: &mut Txn<'_>,
        caller: &Caller,
        operation: Operation,
    ) -> Result<(), KmsError> {
        let identity = self.identity_policies(txn, caller.principal()).await?;
        let request = RequestContext {
            principal: caller.principal(),
            caller_account: caller.account(),
            operation,
            resource: "*",
            encryption_context: None,
        };
        self.evaluator.authorize_account(&request, &identity)
    }

    async fn authorize_key(
        &self,
        txn: &mut Txn<'_>,
        caller: &Caller,
        key: &Key,
        operation: Operation,
        context: Option<&EncryptionContext>,
        grant_tokens: &[String],
    ) -> Result<Authorization, KmsError> {
        let key_policy = self.key_policy(txn, key).await?;
        let identity_policies = self.identity_policies(txn, caller.principal()).await?;
        let token_grants = self
            .grants
            .resolve_tokens(txn, grant_tokens, &key.key_id)
            .await?;
        let visible_grants = self
            .grants
            .visible_grants(txn, &key.key_id, self.now())
            .await?;
        let resource = self.arn(key);

        self.evaluator.authorize(&AuthorizationInput {
            request: RequestContext {
                principal: caller.principal(),
                caller_account: caller.account(),
                operation,
                resource: &resource,
                encryption_context: context,
            },
            key_policy: &key_policy,
            identity_policies: &identity_policies,
            token_grants: &token_grants,
            visible_grants: &visible_grants,
        })
    }

    /// Resolves `key_ref`, applies the state gate for material-bound
    /// operations, then authorizes.
    async fn authorized_key(
        &self,
        txn: &mut Txn<'_>,
        caller: &Caller,
        key_ref: &str,
        operation: Operation,
        context: Option<&EncryptionContext>,
        grant_tokens: &[String],
    ) -> Result<Key, KmsError> {
        let key = self.resolve(txn, key_ref).await?;
        if operation.requires_material() {
            self.check_usable(&key)?;
        }
        self.authorize_key(txn, caller, &key, operation, context, grant_tokens)
            .await?;
        Ok(key)
    }

    async fn material(
        &self,
        txn: &mut Txn<'_>,
        key: &Key,
        version: u32,
    ) -> Result<KeyMaterial, KmsError> {
        let stored = txn
            .get_version(&key.region, &key.key_id, version)
            .await?
            .ok_or_else(|| {
                KmsError::KeyUnavailable(format!(
                    "key {} has no material for version {version}",
                    key.key_id
                ))
            })?;
        self.store.open_material(&stored)
    }

    /// Stages `material` as `version` in the key's region and every replica
    /// region.
    fn stage_version(
        &self,
        txn: &mut Txn<'_>,
        key: &Key,
        version: u32,
        rotation_type: RotationType,
        material: &KeyMaterial,
        now: u64,
    ) -> Result<(), KmsError> {
        let record = KeyVersion {
            key_id: key.key_id.clone(),
            version,
            created_at: now,
            rotation_type,
            wrapped_material: self.store.seal_material(&key.key_id, version, material)?,
        };
        txn.put_version(&key.region, &record)?;
        for region in key.replica_regions() {
            txn.put_version(region, &record)?;
        }
        Ok(())
    }

    fn check_tags(&self, tags: &[Tag], existing: &[Tag]) -> Result<(), KmsError> {
        let mut keys: BTreeSet<&str> = existing.iter().map(|t| t.tag_key.as_str()).collect();
        for tag in tags {
            validate_tag(tag)?;
            keys.insert(&tag.tag_key);
        }
        if keys.len() > self.config.max_tags_per_key {
            return Err(KmsError::LimitExceeded(format!(
                "a key may carry at most {} tags",
                self.config.max_tags_per_key
            )));
        }
        Ok(())
    }

    fn default_policy_json(&self) -> Result<String, KmsError> {
        default_key_policy(&self.config.root_principal()).to_json()
    }

    // ========================================================================
    // Key management
    // ========================================================================

    /// CreateKey.
    pub async fn create_key(
        &self,
        caller: &Caller,
        request: CreateKeyRequest,
    ) -> Result<KeyMetadataResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        self.authorize_account(&mut txn, caller, Operation::CreateKey)
            .await?;

        let key_spec = request.key_spec.unwrap_or(KeySpec::SymmetricDefault);
        let key_usage = request
            .key_usage
            .unwrap_or_else(|| KeyUsage::default_for(key_spec));
        let origin = request.origin.unwrap_or(Origin::ServiceGenerated);
        validate_key_shape(
            key_spec,
            key_usage,
            origin,
            request.custom_key_store_id.as_deref(),
            request.multi_region,
        )?;
        let description = request.description.unwrap_or_default();
        check_description(&description)?;
        self.check_tags(&request.tags, &[])?;
        let policy = match request.policy {
            Some(doc) => {
                PolicyDocument::parse(&doc, PolicyKind::Key)?;
                doc
            },
            None => self.default_policy_json()?,
        };

        txn.guard_quota("keys").await?;
        if txn.list_key_ids().await?.len() >= self.config.max_keys {
            return Err(KmsError::LimitExceeded(format!(
                "region {} already holds {} keys",
                self.region(),
                self.config.max_keys
            )));
        }

        let region = self.region().to_string();
        let mut key = Key {
            key_id: new_key_id(request.multi_region),
            region: region.clone(),
            account_id: self.config.account_id.clone(),
            description,
            key_spec,
            key_usage,
            origin,
            custom_key_store_id: request.custom_key_store_id,
            state: KeyState::Enabled,
            created_at: now,
            deletion_date: None,
            pending_window_days: None,
            rotation: RotationSettings::default(),
            expiration_model: None,
            valid_to: None,
            multi_region: request.multi_region.then(|| MultiRegionConfig {
                role: MultiRegionKeyType::Primary,
                primary_region: region,
                replica_regions: Vec::new(),
            }),
            current_version: 1,
            material_fingerprint: None,
            pending_primary_region: None,
        };

        if origin == Origin::External {
            key.state = KeyState::PendingImport;
            key.current_version = 0;
        } else {
            let material = engine::generate_material(key_spec)?;
            self.stage_version(&mut txn, &key, 1, RotationType::Initial, &material, now)?;
        }

        txn.put_key(&key)?;
        txn.put_policy(&key.region, &key.key_id, &policy)?;
        for tag in &request.tags {
            txn.put_tag(&key.region, &key.key_id, tag)?;
        }
        txn.commit().await?;

        info!(
            key_id = %key.key_id,
            spec = %key.key_spec,
            usage = %key.key_usage,
            origin = %key.origin,
            multi_region = request.multi_region,
            "Key created"
        );
        Ok(KeyMetadataResponse {
            key_metadata: KeyMetadata::from_key(&key, &self.config.partition),
        })
    }

    /// DescribeKey.
    pub async fn describe_key(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<KeyMetadataResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::DescribeKey,
                None,
                &request.grant_tokens,
            )
            .await?;
        Ok(KeyMetadataResponse {
            key_metadata: KeyMetadata::from_key(&key, &self.config.partition),
        })
    }

    /// Read-modify-write of one key record under `operation`'s authorization.
    async fn transition<F>(
        &self,
        caller: &Caller,
        key_ref: &str,
        operation: Operation,
        apply: F,
    ) -> Result<Key, KmsError>
    where
        F: FnOnce(&KeyLifecycleManager, &mut Key, u64) -> Result<(), KmsError>,
    {
        let now = self.now();
        let mut txn = self.store.begin();
        let mut key = self
            .authorized_key(&mut txn, caller, key_ref, operation, None, &[])
            .await?;
        apply(&self.lifecycle, &mut key, now)?;
        txn.put_key(&key)?;
        txn.commit().await?;
        Ok(key)
    }

    /// EnableKey.
    pub async fn enable_key(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let key = self
            .transition(caller, &request.key_id, Operation::EnableKey, |lm, key, _| {
                lm.enable(key)
            })
            .await?;
        info!(key_id = %key.key_id, "Key enabled");
        Ok(EmptyResponse {})
    }

    /// DisableKey.
    pub async fn disable_key(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let key = self
            .transition(caller, &request.key_id, Operation::DisableKey, |lm, key, _| {
                lm.disable(key)
            })
            .await?;
        info!(key_id = %key.key_id, "Key disabled");
        Ok(EmptyResponse {})
    }

    /// ScheduleKeyDeletion.
    pub async fn schedule_key_deletion(
        &self,
        caller: &Caller,
        request: ScheduleKeyDeletionRequest,
    ) -> Result<ScheduleKeyDeletionResponse, KmsError> {
        let days = request.pending_window_in_days;
        let key = self
            .transition(
                caller,
                &request.key_id,
                Operation::ScheduleKeyDeletion,
                |lm, key, now| lm.schedule_deletion(key, days, now),
            )
            .await?;
        warn!(
            key_id = %key.key_id,
            state = %key.state,
            deletion_date = ?key.deletion_date,
            "Key deletion scheduled"
        );
        Ok(ScheduleKeyDeletionResponse {
            key_id: self.arn(&key),
            deletion_date: key.deletion_date,
            key_state: key.state,
            pending_window_in_days: key
                .pending_window_days
                .unwrap_or(self.config.default_pending_window_days),
        })
    }

    /// CancelKeyDeletion.
    pub async fn cancel_key_deletion(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<KeyIdResponse, KmsError> {
        let key = self
            .transition(
                caller,
                &request.key_id,
                Operation::CancelKeyDeletion,
                |lm, key, _| lm.cancel_deletion(key),
            )
            .await?;
        info!(key_id = %key.key_id, "Key deletion cancelled");
        Ok(KeyIdResponse {
            key_id: self.arn(&key),
        })
    }

    /// UpdateKeyDescription.
    pub async fn update_key_description(
        &self,
        caller: &Caller,
        request: UpdateKeyDescriptionRequest,
    ) -> Result<EmptyResponse, KmsError> {
        check_description(&request.description)?;
        let description = request.description;
        self.transition(
            caller,
            &request.key_id,
            Operation::UpdateKeyDescription,
            |_, key, _| {
                if matches!(
                    key.state,
                    KeyState::PendingDeletion | KeyState::PendingReplicaDeletion
                ) {
                    return Err(KmsError::InvalidState(format!(
                        "key {} is pending deletion",
                        key.key_id
                    )));
                }
                key.description = description;
                Ok(())
            },
        )
        .await?;
        Ok(EmptyResponse {})
    }

    /// ListKeys.
    pub async fn list_keys(
        &self,
        caller: &Caller,
        request: ListKeysRequest,
    ) -> Result<ListKeysResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        self.authorize_account(&mut txn, caller, Operation::ListKeys)
            .await?;

        let ids = txn.list_key_ids().await?;
        let page = paginate(ids, String::clone, request.marker.as_deref(), limit)?;
        let truncated = page.truncated();
        Ok(ListKeysResponse {
            keys: page
                .items
                .into_iter()
                .map(|key_id| KeyListEntry {
                    key_arn: key_arn(
                        &self.config.partition,
                        self.region(),
                        &self.config.account_id,
                        &key_id,
                    ),
                    key_id,
                })
                .collect(),
            next_marker: page.next_marker,
            truncated,
        })
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Advances `key` to a fresh version and carries it to every replica.
    async fn roll_version(
        &self,
        txn: &mut Txn<'_>,
        key: &mut Key,
        rotation_type: RotationType,
        now: u64,
    ) -> Result<u32, KmsError> {
        let version = self.lifecycle.rotate(key, now)?;
        let material = engine::generate_material(key.key_spec)?;
        self.stage_version(txn, key, version, rotation_type, &material, now)?;

        for region in key.replica_regions().to_vec() {
            if let Some(mut replica) = txn.get_key_in(&region, &key.key_id).await? {
                self.lifecycle.advance_version(&mut replica, now);
                replica.current_version = version;
                txn.put_key(&replica)?;
            }
        }
        txn.put_key(key)?;

        info!(
            key_id = %key.key_id,
            version,
            rotation = %rotation_type,
            "Key rotated"
        );
        Ok(version)
    }

    /// EnableKeyRotation.
    pub async fn enable_key_rotation(
        &self,
        caller: &Caller,
        request: EnableKeyRotationRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let period = request.rotation_period_in_days;
        let key = self
            .transition(
                caller,
                &request.key_id,
                Operation::EnableKeyRotation,
                |lm, key, now| lm.enable_rotation(key, period, now),
            )
            .await?;
        info!(
            key_id = %key.key_id,
            period_days = ?key.rotation.period_days,
            "Automatic rotation enabled"
        );
        Ok(EmptyResponse {})
    }

    /// DisableKeyRotation.
    pub async fn disable_key_rotation(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let key = self
            .transition(
                caller,
                &request.key_id,
                Operation::DisableKeyRotation,
                |lm, key, _| lm.disable_rotation(key),
            )
            .await?;
        info!(key_id = %key.key_id, "Automatic rotation disabled");
        Ok(EmptyResponse {})
    }

    /// GetKeyRotationStatus.
    pub async fn get_key_rotation_status(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<GetKeyRotationStatusResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::GetKeyRotationStatus,
                None,
                &request.grant_tokens,
            )
            .await?;
        Ok(GetKeyRotationStatusResponse {
            key_id: self.arn(&key),
            key_rotation_enabled: key.rotation.enabled,
            rotation_period_in_days: key.rotation.period_days,
            next_rotation_date: key.rotation.next_rotation,
            last_rotation_date: key.rotation.last_rotation,
        })
    }

    /// RotateKeyOnDemand.
    pub async fn rotate_key_on_demand(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<KeyIdResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let mut key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::RotateKeyOnDemand,
                None,
                &request.grant_tokens,
            )
            .await?;
        self.roll_version(&mut txn, &mut key, RotationType::OnDemand, now)
            .await?;
        txn.commit().await?;
        Ok(KeyIdResponse {
            key_id: self.arn(&key),
        })
    }

    /// ListKeyRotations.
    pub async fn list_key_rotations(
        &self,
        caller: &Caller,
        request: ListKeyRotationsRequest,
    ) -> Result<ListKeyRotationsResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::ListKeyRotations,
                None,
                &[],
            )
            .await?;
        if !key.rotation_eligible() {
            return Err(KmsError::UnsupportedOperation(format!(
                "key {} does not support rotation",
                key.key_id
            )));
        }

        let rotations: Vec<KeyVersion> = txn
            .list_versions(&key.region, &key.key_id)
            .await?
            .into_iter()
            .filter(|v| v.rotation_type != RotationType::Initial)
            .collect();
        let page = paginate(
            rotations,
            |v| format!("{:010}", v.version),
            request.marker.as_deref(),
            limit,
        )?;
        let truncated = page.truncated();
        let key_arn = self.arn(&key);
        Ok(ListKeyRotationsResponse {
            rotations: page
                .items
                .into_iter()
                .map(|v| RotationEntry {
                    key_id: key_arn.clone(),
                    rotation_date: v.created_at,
                    rotation_type: v.rotation_type,
                })
                .collect(),
            next_marker: page.next_marker,
            truncated,
        })
    }

    // ========================================================================
    // Imported material
    // ========================================================================

    /// GetParametersForImport.
    pub async fn get_parameters_for_import(
        &self,
        caller: &Caller,
        request: GetParametersForImportRequest,
    ) -> Result<GetParametersForImportResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::GetParametersForImport,
                None,
                &[],
            )
            .await?;
        let params = self.imports.parameters(
            &key,
            request.wrapping_algorithm,
            request.wrapping_key_spec,
            self.now(),
        )?;
        Ok(GetParametersForImportResponse {
            key_id: self.arn(&key),
            import_token: params.import_token,
            public_key: params.public_key,
            parameters_valid_to: params.parameters_valid_to,
        })
    }

    /// ImportKeyMaterial.
    ///
    /// Reimporting the same material is accepted at any time and refreshes
    /// the expiration settings; different material is rejected.
    pub async fn import_key_material(
        &self,
        caller: &Caller,
        request: ImportKeyMaterialRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let mut key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::ImportKeyMaterial,
                None,
                &[],
            )
            .await?;
        import::check_importable(&key)?;

        let material = self.imports.unwrap_material(
            &key.key_id,
            &request.import_token,
            &request.encrypted_key_material,
            now,
        )?;
        let fingerprint = self.imports.fingerprint(&key.key_id, &material)?;
        let first = self.lifecycle.import_material(
            &mut key,
            &fingerprint,
            request.expiration_model,
            request.valid_to,
            now,
        )?;

        if txn.get_version(&key.region, &key.key_id, 1).await?.is_none() {
            self.stage_version(&mut txn, &key, 1, RotationType::Initial, &material, now)?;
        }
        txn.put_key(&key)?;
        txn.commit().await?;

        info!(
            key_id = %key.key_id,
            first_import = first,
            valid_to = ?key.valid_to,
            "Key material imported"
        );
        Ok(EmptyResponse {})
    }

    /// DeleteImportedKeyMaterial.
    pub async fn delete_imported_key_material(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let mut txn = self.store.begin();
        let mut key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::DeleteImportedKeyMaterial,
                None,
                &[],
            )
            .await?;
        self.lifecycle.delete_imported_material(&mut key)?;
        txn.delete_versions(&key.region, &key.key_id).await?;
        txn.put_key(&key)?;
        txn.commit().await?;

        warn!(key_id = %key.key_id, "Imported key material deleted");
        Ok(EmptyResponse {})
    }

    // ========================================================================
    // Encryption
    // ========================================================================

    /// Encrypts under the current version of `key`.
    async fn seal_with(
        &self,
        txn: &mut Txn<'_>,
        key: &Key,
        algorithm: EncryptionAlgorithm,
        plaintext: &[u8],
        context: Option<&EncryptionContext>,
    ) -> Result<Vec<u8>, KmsError> {
        let material = self.material(txn, key, key.current_version).await?;
        engine::encrypt(
            key,
            key.current_version,
            &material,
            algorithm,
            plaintext,
            context,
        )
    }

    /// Authorizes and decrypts a ciphertext for Decrypt and ReEncrypt.
    ///
    /// Symmetric blobs name their key and version; when the caller also names
    /// a key it must be that one. RSA ciphertexts carry nothing, so the key is
    /// mandatory.
    #[allow(clippy::too_many_arguments)]
    async fn open_ciphertext(
        &self,
        txn: &mut Txn<'_>,
        caller: &Caller,
        key_ref: Option<&str>,
        blob: &[u8],
        context: Option<&EncryptionContext>,
        algorithm: EncryptionAlgorithm,
        grant_tokens: &[String],
        operation: Operation,
    ) -> Result<(Key, Zeroizing<Vec<u8>>), KmsError> {
        if algorithm != EncryptionAlgorithm::SymmetricDefault {
            let key_ref = key_ref.ok_or_else(|| {
                KmsError::Validation(format!("KeyId is required to decrypt with {algorithm}"))
            })?;
            let key = self
                .authorized_key(txn, caller, key_ref, operation, context, grant_tokens)
                .await?;
            let material = self.material(txn, &key, key.current_version).await?;
            let plaintext = engine::decrypt_asymmetric(&key, &material, algorithm, blob)?;
            return Ok((key, plaintext));
        }

        let (header, sealed) = engine::parse_blob(blob)?;
        let key_ref = key_ref.unwrap_or(&header.key_id);
        let key = self
            .authorized_key(txn, caller, key_ref, operation, context, grant_tokens)
            .await?;
        if key.key_id != header.key_id {
            return Err(KmsError::IncorrectKey(format!(
                "ciphertext was not produced by {key_ref}"
            )));
        }
        if header.version == 0 || header.version > key.current_version {
            return Err(KmsError::InvalidCiphertext(format!(
                "unknown key version {}",
                header.version
            )));
        }
        let stored = txn
            .get_version(&key.region, &key.key_id, header.version)
            .await?
            .ok_or_else(|| {
                KmsError::InvalidCiphertext(format!("unknown key version {}", header.version))
            })?;
        let material = self.store.open_material(&stored)?;
        let plaintext = engine::decrypt_symmetric(&header, sealed, &material, context)?;
        debug!(key_id = %key.key_id, version = header.version, "Ciphertext opened");
        Ok((key, plaintext))
    }

    /// Encrypt.
    pub async fn encrypt(
        &self,
        caller: &Caller,
        request: EncryptRequest,
    ) -> Result<EncryptResponse, KmsError> {
        let mut txn = self.store.begin();
        let context = request.encryption_context.as_ref();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::Encrypt,
                context,
                &request.grant_tokens,
            )
            .await?;
        let algorithm = request
            .encryption_algorithm
            .unwrap_or(EncryptionAlgorithm::SymmetricDefault);
        let ciphertext_blob = self
            .seal_with(&mut txn, &key, algorithm, &request.plaintext, context)
            .await?;
        debug!(key_id = %key.key_id, %algorithm, "Encrypted");
        Ok(EncryptResponse {
            ciphertext_blob,
            key_id: self.arn(&key),
            encryption_algorithm: algorithm,
        })
    }

    /// Decrypt.
    pub async fn decrypt(
        &self,
        caller: &Caller,
        request: DecryptRequest,
    ) -> Result<DecryptResponse, KmsError> {
        let mut txn = self.store.begin();
        let algorithm = request
            .encryption_algorithm
            .unwrap_or(EncryptionAlgorithm::SymmetricDefault);
        let (key, plaintext) = self
            .open_ciphertext(
                &mut txn,
                caller,
                request.key_id.as_deref(),
                &request.ciphertext_blob,
                request.encryption_context.as_ref(),
                algorithm,
                &request.grant_tokens,
                Operation::Decrypt,
            )
            .await?;
        Ok(DecryptResponse {
            key_id: self.arn(&key),
            plaintext: plaintext.to_vec(),
            encryption_algorithm: algorithm,
        })
    }

    /// ReEncrypt: decrypt under the source key and encrypt under the
    /// destination key without releasing the plaintext.
    pub async fn re_encrypt(
        &self,
        caller: &Caller,
        request: ReEncryptRequest,
    ) -> Result<ReEncryptResponse, KmsError> {
        let mut txn = self.store.begin();
        let source_algorithm = request
            .source_encryption_algorithm
            .unwrap_or(EncryptionAlgorithm::SymmetricDefault);
        let destination_algorithm = request
            .destination_encryption_algorithm
            .unwrap_or(EncryptionAlgorithm::SymmetricDefault);

        let (source, plaintext) = self
            .open_ciphertext(
                &mut txn,
                caller,
                request.source_key_id.as_deref(),
                &request.ciphertext_blob,
                request.source_encryption_context.as_ref(),
                source_algorithm,
                &request.grant_tokens,
                Operation::ReEncryptFrom,
            )
            .await?;

        let context = request.destination_encryption_context.as_ref();
        let destination = self
            .authorized_key(
                &mut txn,
                caller,
                &request.destination_key_id,
                Operation::ReEncryptTo,
                context,
                &request.grant_tokens,
            )
            .await?;
        let ciphertext_blob = self
            .seal_with(
                &mut txn,
                &destination,
                destination_algorithm,
                &plaintext,
                context,
            )
            .await?;

        debug!(
            source = %source.key_id,
            destination = %destination.key_id,
            "Re-encrypted"
        );
        Ok(ReEncryptResponse {
            ciphertext_blob,
            source_key_id: self.arn(&source),
            key_id: self.arn(&destination),
            source_encryption_algorithm: source_algorithm,
            destination_encryption_algorithm: destination_algorithm,
        })
    }

    // ========================================================================
    // Data keys and randomness
    // ========================================================================

    async fn data_key(
        &self,
        caller: &Caller,
        request: GenerateDataKeyRequest,
        operation: Operation,
        with_plaintext: bool,
    ) -> Result<GenerateDataKeyResponse, KmsError> {
        let len = match (request.number_of_bytes, request.key_spec) {
            (Some(n), None) => n,
            (None, Some(spec)) => spec.byte_len(),
            (Some(_), Some(_)) => {
                return Err(KmsError::Validation(
                    "specify either KeySpec or NumberOfBytes, not both".into(),
                ))
            },
            (None, None) => {
                return Err(KmsError::Validation(
                    "KeySpec or NumberOfBytes is required".into(),
                ))
            },
        };

        let mut txn = self.store.begin();
        let context = request.encryption_context.as_ref();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                operation,
                context,
                &request.grant_tokens,
            )
            .await?;
        engine::check_data_key_target(&key)?;

        let plaintext = engine::generate_data_key(len)?;
        let ciphertext_blob = self
            .seal_with(
                &mut txn,
                &key,
                EncryptionAlgorithm::SymmetricDefault,
                &plaintext,
                context,
            )
            .await?;
        debug!(key_id = %key.key_id, len, "Data key generated");
        Ok(GenerateDataKeyResponse {
            ciphertext_blob,
            plaintext: with_plaintext.then(|| plaintext.to_vec()),
            key_id: self.arn(&key),
        })
    }

    /// GenerateDataKey.
    pub async fn generate_data_key(
        &self,
        caller: &Caller,
        request: GenerateDataKeyRequest,
    ) -> Result<GenerateDataKeyResponse, KmsError> {
        self.data_key(caller, request, Operation::GenerateDataKey, true)
            .await
    }

    /// GenerateDataKeyWithoutPlaintext.
    pub async fn generate_data_key_without_plaintext(
        &self,
        caller: &Caller,
        request: GenerateDataKeyRequest,
    ) -> Result<GenerateDataKeyResponse, KmsError> {
        self.data_key(
            caller,
            request,
            Operation::GenerateDataKeyWithoutPlaintext,
            false,
        )
        .await
    }

    async fn data_key_pair(
        &self,
        caller: &Caller,
        request: GenerateDataKeyPairRequest,
        operation: Operation,
        with_plaintext: bool,
    ) -> Result<GenerateDataKeyPairResponse, KmsError> {
        let mut txn = self.store.begin();
        let context = request.encryption_context.as_ref();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                operation,
                context,
                &request.grant_tokens,
            )
            .await?;
        engine::check_data_key_target(&key)?;

        let pair = engine::generate_data_key_pair(request.key_pair_spec)?;
        let private_key_ciphertext_blob = self
            .seal_with(
                &mut txn,
                &key,
                EncryptionAlgorithm::SymmetricDefault,
                &pair.private_key,
                context,
            )
            .await?;
        debug!(key_id = %key.key_id, spec = %request.key_pair_spec, "Data key pair generated");
        Ok(GenerateDataKeyPairResponse {
            private_key_ciphertext_blob,
            private_key_plaintext: with_plaintext.then(|| pair.private_key.to_vec()),
            public_key: pair.public_key,
            key_id: self.arn(&key),
            key_pair_spec: request.key_pair_spec,
        })
    }

    /// GenerateDataKeyPair.
    pub async fn generate_data_key_pair(
        &self,
        caller: &Caller,
        request: GenerateDataKeyPairRequest,
    ) -> Result<GenerateDataKeyPairResponse, KmsError> {
        self.data_key_pair(caller, request, Operation::GenerateDataKeyPair, true)
            .await
    }

    /// GenerateDataKeyPairWithoutPlaintext.
    pub async fn generate_data_key_pair_without_plaintext(
        &self,
        caller: &Caller,
        request: GenerateDataKeyPairRequest,
    ) -> Result<GenerateDataKeyPairResponse, KmsError> {
        self.data_key_pair(
            caller,
            request,
            Operation::GenerateDataKeyPairWithoutPlaintext,
            false,
        )
        .await
    }

    /// GenerateRandom.
    pub async fn generate_random(
        &self,
        caller: &Caller,
        request: GenerateRandomRequest,
    ) -> Result<GenerateRandomResponse, KmsError> {
        let mut txn = self.store.begin();
        self.authorize_account(&mut txn, caller, Operation::GenerateRandom)
            .await?;
        Ok(GenerateRandomResponse {
            plaintext: engine::generate_random(request.number_of_bytes)?,
        })
    }

    // ========================================================================
    // Signatures, MACs and key agreement
    // ========================================================================

    /// Sign.
    pub async fn sign(&self, caller: &Caller, request: SignRequest) -> Result<SignResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::Sign,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let signature = engine::sign(
            &key,
            &material,
            request.signing_algorithm,
            &request.message,
            request.message_type.unwrap_or(MessageType::Raw),
        )?;
        Ok(SignResponse {
            key_id: self.arn(&key),
            signature,
            signing_algorithm: request.signing_algorithm,
        })
    }

    /// Verify.
    pub async fn verify(
        &self,
        caller: &Caller,
        request: VerifyRequest,
    ) -> Result<VerifyResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::Verify,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let signature_valid = engine::verify(
            &key,
            &material,
            request.signing_algorithm,
            &request.message,
            request.message_type.unwrap_or(MessageType::Raw),
            &request.signature,
        )?;
        Ok(VerifyResponse {
            key_id: self.arn(&key),
            signature_valid,
            signing_algorithm: request.signing_algorithm,
        })
    }

    /// GenerateMac.
    pub async fn generate_mac(
        &self,
        caller: &Caller,
        request: GenerateMacRequest,
    ) -> Result<GenerateMacResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::GenerateMac,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let mac = engine::generate_mac(&key, &material, request.mac_algorithm, &request.message)?;
        Ok(GenerateMacResponse {
            key_id: self.arn(&key),
            mac,
            mac_algorithm: request.mac_algorithm,
        })
    }

    /// VerifyMac.
    pub async fn verify_mac(
        &self,
        caller: &Caller,
        request: VerifyMacRequest,
    ) -> Result<VerifyMacResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::VerifyMac,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let mac_valid = engine::verify_mac(
            &key,
            &material,
            request.mac_algorithm,
            &request.message,
            &request.mac,
        )?;
        Ok(VerifyMacResponse {
            key_id: self.arn(&key),
            mac_valid,
            mac_algorithm: request.mac_algorithm,
        })
    }

    /// DeriveSharedSecret.
    pub async fn derive_shared_secret(
        &self,
        caller: &Caller,
        request: DeriveSharedSecretRequest,
    ) -> Result<DeriveSharedSecretResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::DeriveSharedSecret,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let secret = engine::derive_shared_secret(&key, &material, &request.public_key)?;
        Ok(DeriveSharedSecretResponse {
            key_id: self.arn(&key),
            shared_secret: secret.to_vec(),
            key_agreement_algorithm: request.key_agreement_algorithm,
            key_origin: key.origin,
        })
    }

    /// GetPublicKey.
    pub async fn get_public_key(
        &self,
        caller: &Caller,
        request: KeyIdRequest,
    ) -> Result<GetPublicKeyResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::GetPublicKey,
                None,
                &request.grant_tokens,
            )
            .await?;
        let material = self.material(&mut txn, &key, key.current_version).await?;
        let public_key = engine::public_key(&key, &material)?;
        let metadata = KeyMetadata::from_key(&key, &self.config.partition);
        Ok(GetPublicKeyResponse {
            key_id: metadata.arn,
            public_key,
            key_spec: key.key_spec,
            key_usage: key.key_usage,
            encryption_algorithms: metadata.encryption_algorithms,
            signing_algorithms: metadata.signing_algorithms,
            key_agreement_algorithms: metadata.key_agreement_algorithms,
        })
    }

    // ========================================================================
    // Grants
    // ========================================================================

    fn grant_entry(&self, grant: Grant) -> GrantListEntry {
        let issuing_account = principal_account(&grant.issuing_principal)
            .map(|account| format!("arn:{}:iam::{account}:root", self.config.partition))
            .unwrap_or_else(|| grant.issuing_principal.clone());
        GrantListEntry {
            key_id: grant.key_id,
            grant_id: grant.grant_id,
            name: grant.name,
            creation_date: grant.created_at,
            grantee_principal: grant.grantee_principal,
            retiring_principal: grant.retiring_principal,
            issuing_account,
            operations: grant.operations,
            constraints: grant.constraints,
        }
    }

    /// CreateGrant.
    pub async fn create_grant(
        &self,
        caller: &Caller,
        request: CreateGrantRequest,
    ) -> Result<CreateGrantResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let key = self.resolve(&mut txn, &request.key_id).await?;
        let authorization = self
            .authorize_key(
                &mut txn,
                caller,
                &key,
                Operation::CreateGrant,
                None,
                &request.grant_tokens,
            )
            .await?;
        if matches!(
            key.state,
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion
        ) {
            return Err(KmsError::InvalidState(format!(
                "key {} is pending deletion",
                key.key_id
            )));
        }
        // A grantee holding CreateGrant through a grant can only pass on what
        // that grant holds, under at least its constraints.
        if let Authorization::Grant(parent) = &authorization {
            check_sub_grant(parent, &request.operations, request.constraints.as_ref())?;
        }

        let (grant, grant_token) = self
            .grants
            .create(
                &mut txn,
                &key,
                NewGrant {
                    grantee_principal: request.grantee_principal,
                    retiring_principal: request.retiring_principal,
                    operations: request.operations,
                    constraints: request.constraints,
                    name: request.name,
                },
                caller.principal(),
                now,
            )
            .await?;
        txn.commit().await?;
        Ok(CreateGrantResponse {
            grant_token,
            grant_id: grant.grant_id,
        })
    }

    /// ListGrants.
    pub async fn list_grants(
        &self,
        caller: &Caller,
        request: ListGrantsRequest,
    ) -> Result<ListGrantsResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::ListGrants,
                None,
                &[],
            )
            .await?;
        let filter = GrantFilter {
            grant_id: request.grant_id,
            grantee_principal: request.grantee_principal,
        };
        let page = self
            .grants
            .list(
                &mut txn,
                &key.key_id,
                &filter,
                request.marker.as_deref(),
                limit,
            )
            .await?;
        let truncated = page.truncated();
        Ok(ListGrantsResponse {
            grants: page.items.into_iter().map(|g| self.grant_entry(g)).collect(),
            next_marker: page.next_marker,
            truncated,
        })
    }

    /// ListRetirableGrants.
    pub async fn list_retirable_grants(
        &self,
        caller: &Caller,
        request: ListRetirableGrantsRequest,
    ) -> Result<ListGrantsResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        self.authorize_account(&mut txn, caller, Operation::ListRetirableGrants)
            .await?;
        let page = self
            .grants
            .list_retirable(
                &mut txn,
                &request.retiring_principal,
                request.marker.as_deref(),
                limit,
            )
            .await?;
        let truncated = page.truncated();
        Ok(ListGrantsResponse {
            grants: page.items.into_iter().map(|g| self.grant_entry(g)).collect(),
            next_marker: page.next_marker,
            truncated,
        })
    }

    /// RetireGrant.
    pub async fn retire_grant(
        &self,
        caller: &Caller,
        request: RetireGrantRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let target = match (request.grant_token, request.key_id, request.grant_id) {
            (Some(token), _, _) => RetireTarget::Token(token),
            (None, Some(key_ref), Some(grant_id)) => {
                let key = self.resolve(&mut txn, &key_ref).await?;
                RetireTarget::Id {
                    key_id: key.key_id,
                    grant_id,
                }
            },
            _ => {
                return Err(KmsError::Validation(
                    "GrantToken, or KeyId and GrantId, are required".into(),
                ))
            },
        };
        self.grants
            .retire(&mut txn, target, caller.principal(), now)
            .await?;
        txn.commit().await?;
        Ok(EmptyResponse {})
    }

    /// RevokeGrant.
    pub async fn revoke_grant(
        &self,
        caller: &Caller,
        request: RevokeGrantRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::RevokeGrant,
                None,
                &[],
            )
            .await?;
        self.grants
            .revoke(&mut txn, &key.key_id, &request.grant_id, now)
            .await?;
        txn.commit().await?;
        Ok(EmptyResponse {})
    }

    // ========================================================================
    // Key policies
    // ========================================================================

    /// GetKeyPolicy.
    pub async fn get_key_policy(
        &self,
        caller: &Caller,
        request: GetKeyPolicyRequest,
    ) -> Result<GetKeyPolicyResponse, KmsError> {
        let name = request.policy_name.as_deref().unwrap_or(DEFAULT_POLICY_NAME);
        if name != DEFAULT_POLICY_NAME {
            return Err(KmsError::NotFound(format!("no key policy named {name}")));
        }
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::GetKeyPolicy,
                None,
                &[],
            )
            .await?;
        let policy = match txn.get_policy(&key.key_id).await? {
            Some(policy) => policy,
            None => self.default_policy_json()?,
        };
        Ok(GetKeyPolicyResponse {
            policy,
            policy_name: DEFAULT_POLICY_NAME.to_string(),
        })
    }

    /// PutKeyPolicy.
    pub async fn put_key_policy(
        &self,
        caller: &Caller,
        request: PutKeyPolicyRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let name = request.policy_name.as_deref().unwrap_or(DEFAULT_POLICY_NAME);
        if name != DEFAULT_POLICY_NAME {
            return Err(KmsError::Validation(format!(
                "the only supported policy name is {DEFAULT_POLICY_NAME}"
            )));
        }
        PolicyDocument::parse(&request.policy, PolicyKind::Key)?;

        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::PutKeyPolicy,
                None,
                &[],
            )
            .await?;
        txn.put_policy(&key.region, &key.key_id, &request.policy)?;
        txn.commit().await?;
        info!(key_id = %key.key_id, "Key policy replaced");
        Ok(EmptyResponse {})
    }

    /// ListKeyPolicies.
    pub async fn list_key_policies(
        &self,
        caller: &Caller,
        request: ListKeyPoliciesRequest,
    ) -> Result<ListKeyPoliciesResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        self.authorized_key(
            &mut txn,
            caller,
            &request.key_id,
            Operation::ListKeyPolicies,
            None,
            &[],
        )
        .await?;
        let page = paginate(
            vec![DEFAULT_POLICY_NAME.to_string()],
            String::clone,
            request.marker.as_deref(),
            limit,
        )?;
        let truncated = page.truncated();
        Ok(ListKeyPoliciesResponse {
            policy_names: page.items,
            next_marker: page.next_marker,
            truncated,
        })
    }

    /// Attaches an identity policy to `principal`.
    ///
    /// Identity policies are administered by the embedding process, not
    /// through a KMS operation.
    pub async fn attach_identity_policy(
        &self,
        principal: &str,
        name: &str,
        document: &str,
    ) -> Result<(), KmsError> {
        if name.is_empty() || name.contains('/') {
            return Err(KmsError::Validation(format!("invalid policy name: {name}")));
        }
        PolicyDocument::parse(document, PolicyKind::Identity)?;
        let mut txn = self.store.begin();
        txn.put_identity_policy(principal, name, document)?;
        txn.commit().await?;
        info!(principal, name, "Identity policy attached");
        Ok(())
    }

    /// Removes an identity policy from `principal`.
    pub async fn detach_identity_policy(&self, principal: &str, name: &str) -> Result<(), KmsError> {
        let mut txn = self.store.begin();
        txn.delete_identity_policy(principal, name);
        txn.commit().await?;
        info!(principal, name, "Identity policy detached");
        Ok(())
    }

    // ========================================================================
    // Aliases
    // ========================================================================

    async fn alias_target(
        &self,
        txn: &mut Txn<'_>,
        caller: &Caller,
        target: &str,
        operation: Operation,
    ) -> Result<Key, KmsError> {
        if matches!(KeyRef::parse(target)?, KeyRef::Alias { .. }) {
            return Err(KmsError::Validation(
                "an alias must point at a key id or key ARN".into(),
            ));
        }
        let key = self
            .authorized_key(txn, caller, target, operation, None, &[])
            .await?;
        if matches!(
            key.state,
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion
        ) {
            return Err(KmsError::InvalidState(format!(
                "key {} is pending deletion",
                key.key_id
            )));
        }
        Ok(key)
    }

    /// CreateAlias.
    pub async fn create_alias(
        &self,
        caller: &Caller,
        request: AliasRequest,
    ) -> Result<EmptyResponse, KmsError> {
        validate_alias_name(&request.alias_name)?;
        let now = self.now();
        let mut txn = self.store.begin();
        let key = self
            .alias_target(&mut txn, caller, &request.target_key_id, Operation::CreateAlias)
            .await?;

        if txn.get_alias(&request.alias_name).await?.is_some() {
            return Err(KmsError::AlreadyExists(format!(
                "alias {} already exists",
                request.alias_name
            )));
        }
        txn.guard_quota("aliases").await?;
        if txn.list_aliases().await?.len() >= self.config.max_aliases {
            return Err(KmsError::LimitExceeded(format!(
                "at most {} aliases per region",
                self.config.max_aliases
            )));
        }

        txn.put_alias(&Alias {
            name: request.alias_name.clone(),
            target_key_id: key.key_id.clone(),
            created_at: now,
            updated_at: now,
        })?;
        txn.commit().await?;
        info!(alias = %request.alias_name, key_id = %key.key_id, "Alias created");
        Ok(EmptyResponse {})
    }

    /// UpdateAlias. The new target must have the same usage and key type.
    pub async fn update_alias(
        &self,
        caller: &Caller,
        request: AliasRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let mut alias = txn.get_alias(&request.alias_name).await?.ok_or_else(|| {
            KmsError::NotFound(format!("alias {} does not exist", request.alias_name))
        })?;

        let current = self
            .authorized_key(
                &mut txn,
                caller,
                &alias.target_key_id,
                Operation::UpdateAlias,
                None,
                &[],
            )
            .await?;
        let target = self
            .alias_target(&mut txn, caller, &request.target_key_id, Operation::UpdateAlias)
            .await?;
        if current.key_usage != target.key_usage
            || current.key_spec.is_symmetric() != target.key_spec.is_symmetric()
        {
            return Err(KmsError::Validation(format!(
                "{} ({}, {}) cannot replace {} ({}, {})",
                target.key_id,
                target.key_spec,
                target.key_usage,
                current.key_id,
                current.key_spec,
                current.key_usage
            )));
        }

        alias.target_key_id = target.key_id.clone();
        alias.updated_at = now;
        txn.put_alias(&alias)?;
        txn.commit().await?;
        info!(alias = %alias.name, key_id = %target.key_id, "Alias retargeted");
        Ok(EmptyResponse {})
    }

    /// DeleteAlias.
    pub async fn delete_alias(
        &self,
        caller: &Caller,
        request: DeleteAliasRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let mut txn = self.store.begin();
        let alias = txn.get_alias(&request.alias_name).await?.ok_or_else(|| {
            KmsError::NotFound(format!("alias {} does not exist", request.alias_name))
        })?;
        match txn.get_key(&alias.target_key_id).await? {
            Some(key) => {
                self.authorize_key(&mut txn, caller, &key, Operation::DeleteAlias, None, &[])
                    .await?;
            },
            None => {
                self.authorize_account(&mut txn, caller, Operation::DeleteAlias)
                    .await?;
            },
        }
        txn.delete_alias(&alias.name);
        txn.commit().await?;
        info!(alias = %alias.name, "Alias deleted");
        Ok(EmptyResponse {})
    }

    /// ListAliases, optionally for one key.
    pub async fn list_aliases(
        &self,
        caller: &Caller,
        request: ListAliasesRequest,
    ) -> Result<ListAliasesResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        let key_id = match &request.key_id {
            Some(key_ref) => Some(
                self.authorized_key(&mut txn, caller, key_ref, Operation::ListAliases, None, &[])
                    .await?
                    .key_id,
            ),
            None => {
                self.authorize_account(&mut txn, caller, Operation::ListAliases)
                    .await?;
                None
            },
        };

        let aliases: Vec<Alias> = txn
            .list_aliases()
            .await?
            .into_iter()
            .filter(|a| key_id.as_ref().map_or(true, |id| &a.target_key_id == id))
            .collect();
        let page = paginate(aliases, |a| a.name.clone(), request.marker.as_deref(), limit)?;
        let truncated = page.truncated();
        Ok(ListAliasesResponse {
            aliases: page
                .items
                .into_iter()
                .map(|a| AliasListEntry {
                    alias_arn: alias_arn(
                        &self.config.partition,
                        self.region(),
                        &self.config.account_id,
                        &a.name,
                    ),
                    alias_name: a.name,
                    target_key_id: a.target_key_id,
                    creation_date: a.created_at,
                    last_updated_date: a.updated_at,
                })
                .collect(),
            next_marker: page.next_marker,
            truncated,
        })
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// TagResource. Existing tag keys are overwritten.
    pub async fn tag_resource(
        &self,
        caller: &Caller,
        request: TagResourceRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::TagResource,
                None,
                &[],
            )
            .await?;
        if matches!(
            key.state,
            KeyState::PendingDeletion | KeyState::PendingReplicaDeletion
        ) {
            return Err(KmsError::InvalidState(format!(
                "key {} is pending deletion",
                key.key_id
            )));
        }
        let existing = txn.list_tags(&key.region, &key.key_id).await?;
        self.check_tags(&request.tags, &existing)?;
        for tag in &request.tags {
            txn.put_tag(&key.region, &key.key_id, tag)?;
        }
        txn.commit().await?;
        Ok(EmptyResponse {})
    }

    /// UntagResource.
    pub async fn untag_resource(
        &self,
        caller: &Caller,
        request: UntagResourceRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::UntagResource,
                None,
                &[],
            )
            .await?;
        for tag_key in &request.tag_keys {
            txn.delete_tag(&key.region, &key.key_id, tag_key);
        }
        txn.commit().await?;
        Ok(EmptyResponse {})
    }

    /// ListResourceTags.
    pub async fn list_resource_tags(
        &self,
        caller: &Caller,
        request: ListResourceTagsRequest,
    ) -> Result<ListResourceTagsResponse, KmsError> {
        let limit = self.config.page_limit(request.limit)?;
        let mut txn = self.store.begin();
        let key = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::ListResourceTags,
                None,
                &[],
            )
            .await?;
        let tags = txn.list_tags(&key.region, &key.key_id).await?;
        let page = paginate(tags, |t| t.tag_key.clone(), request.marker.as_deref(), limit)?;
        let truncated = page.truncated();
        Ok(ListResourceTagsResponse {
            tags: page.items,
            next_marker: page.next_marker,
            truncated,
        })
    }

    // ========================================================================
    // Multi-Region
    // ========================================================================

    /// ReplicateKey: creates a replica of a primary key in another region.
    pub async fn replicate_key(
        &self,
        caller: &Caller,
        request: ReplicateKeyRequest,
    ) -> Result<ReplicateKeyResponse, KmsError> {
        let now = self.now();
        let mut txn = self.store.begin();
        let mut primary = self
            .authorized_key(
                &mut txn,
                caller,
                &request.key_id,
                Operation::ReplicateKey,
                None,
                &[],
            )
            .await?;
        let replica = self.lifecycle.replicate(
            &mut primary,
            &request.replica_region,
            request.description,
            now,
        )?;
        if txn.get_key_in(&replica.region, &replica.key_id).await?.is_some() {
            return Err(KmsError::AlreadyExists(format!(
                "key {} already exists in {}",
                replica.key_id, replica.region
            )));
        }

        let policy = match request.policy {
            Some(doc) => {
                PolicyDocument::parse(&doc, PolicyKind::Key)?;
                doc
            },
            None => match txn.get_policy(&primary.key_id).await? {
                Some(doc) => doc,
                None => self.default_policy_json()?,
            },
        };
        let tags = match request.tags {
            Some(tags) => tags,
            None => txn.list_tags(&primary.region, &primary.key_id).await?,
        };
        self.check_tags(&tags, &[])?;

        for version in txn.list_versions(&primary.region, &primary.key_id).await? {
            txn.put_version(&replica.region, &version)?;
        }
        txn.put_key(&primary)?;
        txn.put_key(&replica)?;
        txn.put_policy(&replica.region, &replica.key_id, &policy)?;
        for tag in &tags {
            txn.put_tag(&replica.region, &replica.key_id, tag)?;
        }
        txn.commit().await?;

        info!(
            key_id = %replica.key_id,
            region = %replica.region,
            primary_region = %primary.region,
            "Key replicated"
        );
        Ok(ReplicateKeyResponse {
            replica_key_metadata: KeyMetadata::from_key(&replica, &self.config.partition),
            replica_policy: policy,
            replica_tags: tags,
        })
    }

    /// UpdatePrimaryRegion.
    ///
    /// Both records pass through `Updating` in a first commit and swap roles
    /// in a second; crypto stays available throughout. If the second commit
    /// does not happen, maintenance completes it.
    pub async fn update_primary_region(
        &self,
        caller: &Caller,
        request: UpdatePrimaryRegionRequest,
    ) -> Result<EmptyResponse, KmsError> {
        let key_id = {
            let mut txn = self.store.begin();
            let mut primary = self
                .authorized_key(
                    &mut txn,
                    caller,
                    &request.key_id,
                    Operation::UpdatePrimaryRegion,
                    None,
                    &[],
                )
                .await?;
            let mut replica = txn
                .get_key_in(&request.primary_region, &primary.key_id)
                .await?
                .ok_or_else(|| {
                    KmsError::NotFound(format!(
                        "no replica of {} in {}",
                        primary.key_id, request.primary_region
                    ))
                })?;
            self.lifecycle
                .begin_primary_update(&mut primary, &mut replica)?;
            txn.put_key(&primary)?;
            txn.put_key(&replica)?;
            txn.commit().await?;
            primary.key_id
        };

        let mut txn = self.store.begin();
        let Some(old_primary) = txn.get_key(&key_id).await? else {
            return Ok(EmptyResponse {});
        };
        self.complete_primary_update(&mut txn, old_primary).await?;
        match txn.commit().await {
            Ok(()) => Ok(EmptyResponse {}),
            // Maintenance finished the swap first.
            Err(KmsError::Conflict(_)) => Ok(EmptyResponse {}),
            Err(err) => Err(err),
        }
    }

    /// Stages the second phase of a primary-region update started on
    /// `old_primary`.
    async fn complete_primary_update(
        &self,
        txn: &mut Txn<'_>,
        mut old_primary: Key,
    ) -> Result<(), KmsError> {
        let Some(target) = old_primary.pending_primary_region.clone() else {
            return Ok(());
        };
        if old_primary.state != KeyState::Updating || !old_primary.is_primary() {
            return Ok(());
        }
        let key_id = old_primary.key_id.clone();
        let mut new_primary = txn.get_key_in(&target, &key_id).await?.ok_or_else(|| {
            KmsError::Internal(format!("replica of {key_id} in {target} disappeared"))
        })?;

        let mut others = Vec::new();
        for region in old_primary.replica_regions().to_vec() {
            if region == target {
                continue;
            }
            if let Some(other) = txn.get_key_in(&region, &key_id).await? {
                others.push(other);
            }
        }

        self.lifecycle
            .complete_primary_update(&mut old_primary, &mut new_primary, &mut others);
        txn.put_key(&old_primary)?;
        txn.put_key(&new_primary)?;
        for other in &others {
            txn.put_key(other)?;
        }
        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// One pass over every key of the region: physical deletion, scheduled
    /// rotation, material expiry and interrupted primary updates.
    ///
    /// Each key is handled in its own transaction; a key that fails is
    /// skipped and picked up by the next pass.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, KmsError> {
        let now = self.now();
        let key_ids = self.store.begin().list_key_ids().await?;
        let mut report = MaintenanceReport::default();

        for key_id in key_ids {
            if let Err(err) = self.maintain_key(&key_id, now, &mut report).await {
                warn!(key_id = %key_id, error = %err, "Maintenance skipped key");
                report.failed += 1;
            }
        }

        if report != MaintenanceReport::default() {
            info!(
                deleted = report.deleted,
                rotated = report.rotated,
                expired = report.expired,
                promoted = report.promoted,
                failed = report.failed,
                "Maintenance pass complete"
            );
        }
        Ok(report)
    }

    async fn maintain_key(
        &self,
        key_id: &str,
        now: u64,
        report: &mut MaintenanceReport,
    ) -> Result<(), KmsError> {
        let mut txn = self.store.begin();
        let Some(mut key) = txn.get_key(key_id).await? else {
            return Ok(());
        };

        if self.lifecycle.deletion_due(&key, now) {
            self.purge(&mut txn, &key, now).await?;
            txn.commit().await?;
            report.deleted += 1;
        } else if key.state == KeyState::PendingReplicaDeletion {
            self.lifecycle.replicas_gone(&mut key, now);
            if key.state == KeyState::PendingDeletion {
                txn.put_key(&key)?;
                txn.commit().await?;
            }
        } else if key.state == KeyState::Updating && key.is_primary() {
            self.complete_primary_update(&mut txn, key).await?;
            txn.commit().await?;
            report.promoted += 1;
        } else if self.lifecycle.rotation_due(&key, now) {
            self.roll_version(&mut txn, &mut key, RotationType::Automatic, now)
                .await?;
            txn.commit().await?;
            report.rotated += 1;
        } else if self.lifecycle.material_expired(&key, now) {
            self.lifecycle.delete_imported_material(&mut key)?;
            txn.delete_versions(&key.region, &key.key_id).await?;
            txn.put_key(&key)?;
            txn.commit().await?;
            warn!(key_id = %key.key_id, "Imported key material expired");
            report.expired += 1;
        }
        Ok(())
    }

    /// Stages removal of a key and everything hanging off it.
    async fn purge(&self, txn: &mut Txn<'_>, key: &Key, now: u64) -> Result<(), KmsError> {
        txn.delete_versions(&key.region, &key.key_id).await?;
        txn.delete_policy(&key.region, &key.key_id);
        for tag in txn.list_tags(&key.region, &key.key_id).await? {
            txn.delete_tag(&key.region, &key.key_id, &tag.tag_key);
        }
        for alias in txn.list_aliases().await? {
            if alias.target_key_id == key.key_id {
                txn.delete_alias(&alias.name);
            }
        }
        for grant in txn.grants_for_key(&key.key_id).await? {
            txn.delete_grant(&grant, now)?;
        }

        if let Some(mr) = key.multi_region.as_ref().filter(|_| key.is_replica()) {
            if let Some(mut primary) = txn.get_key_in(&mr.primary_region, &key.key_id).await? {
                if let Some(primary_mr) = primary.multi_region.as_mut() {
                    primary_mr.replica_regions.retain(|r| r != &key.region);
                }
                self.lifecycle.replicas_gone(&mut primary, now);
                txn.put_key(&primary)?;
            }
        }

        txn.delete_key(key);
        warn!(key_id = %key.key_id, region = %key.region, "Key deleted permanently");
        Ok(())
    }
}

fn validate_key_shape(
    spec: KeySpec,
    usage: KeyUsage,
    origin: Origin,
    custom_key_store_id: Option<&str>,
    multi_region: bool,
) -> Result<(), KmsError> {
    if !spec.supports_usage(usage) {
        return Err(KmsError::InvalidParameterCombination(format!(
            "{spec} keys cannot be used for {usage}"
        )));
    }
    match origin {
        Origin::External if !spec.is_symmetric() => {
            Err(KmsError::InvalidParameterCombination(format!(
                "EXTERNAL origin requires SYMMETRIC_DEFAULT, got {spec}"
            )))
        },
        Origin::CustomStore => {
            if custom_key_store_id.is_none() {
                return Err(KmsError::Validation(
                    "CustomKeyStoreId is required for CUSTOM_STORE keys".into(),
                ));
            }
            if !spec.is_symmetric() {
                return Err(KmsError::InvalidParameterCombination(format!(
                    "CUSTOM_STORE origin requires SYMMETRIC_DEFAULT, got {spec}"
                )));
            }
            if multi_region {
                return Err(KmsError::UnsupportedOperation(
                    "multi-Region keys cannot live in a custom key store".into(),
                ));
            }
            Ok(())
        },
        _ if custom_key_store_id.is_some() => Err(KmsError::InvalidParameterCombination(
            "CustomKeyStoreId requires CUSTOM_STORE origin".into(),
        )),
        _ => Ok(()),
    }
}

fn check_description(description: &str) -> Result<(), KmsError> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(KmsError::Validation(format!(
            "description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}

/// A grant created under the authority of `parent` may delegate only the
/// parent's operations, and no context the parent would refuse.
fn check_sub_grant(
    parent: &Grant,
    operations: &[Operation],
    constraints: Option<&GrantConstraints>,
) -> Result<(), KmsError> {
    if let Some(operation) = operations.iter().find(|op| !parent.operations.contains(*op)) {
        return Err(KmsError::AccessDenied(format!(
            "grant {} does not delegate {}",
            parent.grant_id,
            operation.action()
        )));
    }
    let Some(required) = &parent.constraints else {
        return Ok(());
    };
    let narrower = constraints.is_some_and(|c| {
        c == required
            || c
                .encryption_context_equals
                .as_ref()
                .is_some_and(|ctx| required.satisfied_by(Some(ctx)))
            || (required.encryption_context_equals.is_none()
                && c
                    .encryption_context_subset
                    .as_ref()
                    .is_some_and(|ctx| required.satisfied_by(Some(ctx))))
    });
    if !narrower {
        return Err(KmsError::AccessDenied(format!(
            "grant {} requires its encryption context constraints on derived grants",
            parent.grant_id
        )));
    }
    Ok(())
}
