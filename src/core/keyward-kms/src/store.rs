//! Typed, transactional repository over a [`StorageBackend`].
//!
//! Every logical operation opens one [`Txn`], reads what it needs (the row
//! versions are remembered), stages its writes and commits them as a single
//! [`WriteBatch`]. Each staged write is conditioned on the version that was
//! read, and rows that were only read are re-checked, so a concurrent writer
//! that got there first turns the commit into a retryable conflict instead of
//! a lost update.
//!
//! Key material never reaches the backend in the clear: each version is
//! sealed with AES-256-GCM under a key derived from the master key, the key
//! id and the version number.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use keyward_crypto::{aead, kdf, KeyMaterial, MasterKey};
use keyward_storage::{Precondition, StorageBackend, StorageError, WriteBatch};

use crate::error::KmsError;
use crate::model::{Alias, Grant, GrantTombstone, Key, KeyVersion, Tag};

const WRAP_LABEL: &str = "keyward-wrap-v1";

/// Storage key layout.
mod paths {
    pub fn keys(region: &str) -> String {
        format!("key/{region}/")
    }

    pub fn key(region: &str, key_id: &str) -> String {
        format!("key/{region}/{key_id}")
    }

    pub fn versions(region: &str, key_id: &str) -> String {
        format!("version/{region}/{key_id}/")
    }

    pub fn version(region: &str, key_id: &str, version: u32) -> String {
        format!("version/{region}/{key_id}/{version:010}")
    }

    pub fn grant(region: &str, grant_id: &str) -> String {
        format!("grant/{region}/{grant_id}")
    }

    pub fn grants_by_key(region: &str, key_id: &str) -> String {
        format!("grant-by-key/{region}/{key_id}/")
    }

    pub fn grant_by_key(region: &str, key_id: &str, grant_id: &str) -> String {
        format!("grant-by-key/{region}/{key_id}/{grant_id}")
    }

    /// Principal ARNs contain `/`, so they are stored hex-encoded to keep
    /// `user/a` from prefixing `user/a/b`.
    pub fn principal(principal: &str) -> String {
        hex::encode(principal)
    }

    pub fn grants_by_retiree(region: &str, principal: &str) -> String {
        format!("grant-by-retiree/{region}/{}/", self::principal(principal))
    }

    pub fn grant_by_retiree(region: &str, principal: &str, grant_id: &str) -> String {
        format!("grant-by-retiree/{region}/{}/{grant_id}", self::principal(principal))
    }

    pub fn grant_revoked(region: &str, grant_id: &str) -> String {
        format!("grant-revoked/{region}/{grant_id}")
    }

    pub fn aliases(region: &str) -> String {
        format!("alias/{region}/")
    }

    pub fn alias(region: &str, name: &str) -> String {
        format!("alias/{region}/{name}")
    }

    pub fn policy(region: &str, key_id: &str) -> String {
        format!("policy/{region}/{key_id}/default")
    }

    pub fn tags(region: &str, key_id: &str) -> String {
        format!("tag/{region}/{key_id}/")
    }

    pub fn tag(region: &str, key_id: &str, tag_key: &str) -> String {
        format!("tag/{region}/{key_id}/{tag_key}")
    }

    pub fn quota(region: &str, scope: &str) -> String {
        format!("quota/{region}/{scope}")
    }

    pub fn identity_policies(principal: &str) -> String {
        format!("identity-policy/{}/", self::principal(principal))
    }

    pub fn identity_policy(principal: &str, name: &str) -> String {
        format!("identity-policy/{}/{name}", self::principal(principal))
    }
}

/// Last path segment, i.e. the id an index entry points at.
fn leaf(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Repository of keys, versions, grants, aliases, policies and tags for one
/// region.
#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn StorageBackend>,
    master_key: Arc<MasterKey>,
    region: String,
    timeout: Duration,
}

impl KeyStore {
    /// Creates a store for `region`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        master_key: MasterKey,
        region: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            master_key: Arc::new(master_key),
            region: region.into(),
            timeout,
        }
    }

    /// Region served by this store.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Opens a transaction.
    pub fn begin(&self) -> Txn<'_> {
        Txn {
            store: self,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Runs one backend call under the storage deadline.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, KmsError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(KmsError::from),
            Err(_) => Err(KmsError::DependencyTimeout(format!(
                "storage call exceeded {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    fn wrap_aad(key_id: &str, version: u32) -> Vec<u8> {
        format!("{key_id}:{version}").into_bytes()
    }

    /// Seals material for persistence as `version` of `key_id`.
    pub fn seal_material(
        &self,
        key_id: &str,
        version: u32,
        material: &KeyMaterial,
    ) -> Result<Vec<u8>, KmsError> {
        let wrapping_key = kdf::derive_subkey(
            self.master_key.as_bytes(),
            &[WRAP_LABEL, key_id, &version.to_string()],
        )?;
        Ok(aead::seal(
            &*wrapping_key,
            material.as_bytes(),
            &Self::wrap_aad(key_id, version),
        )?)
    }

    /// Recovers the material of a stored version.
    pub fn open_material(&self, version: &KeyVersion) -> Result<KeyMaterial, KmsError> {
        let wrapping_key = kdf::derive_subkey(
            self.master_key.as_bytes(),
            &[WRAP_LABEL, &version.key_id, &version.version.to_string()],
        )?;
        let plaintext = aead::open(
            &*wrapping_key,
            &version.wrapped_material,
            &Self::wrap_aad(&version.key_id, version.version),
        )
        .map_err(|_| {
            KmsError::Internal(format!(
                "stored material for {} v{} failed authentication",
                version.key_id, version.version
            ))
        })?;
        Ok(KeyMaterial::from_slice(&plaintext))
    }
}

/// One logical operation's view of the store.
pub struct Txn<'a> {
    store: &'a KeyStore,
    reads: HashMap<String, Option<u64>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl Txn<'_> {
    // ========================================================================
    // Raw access
    // ========================================================================

    async fn read_raw(&mut self, path: String) -> Result<Option<Vec<u8>>, KmsError> {
        if let Some(staged) = self.writes.get(&path) {
            return Ok(staged.clone());
        }
        let row = self
            .store
            .call(self.store.backend.get_versioned(&path))
            .await?;
        self.reads
            .entry(path)
            .or_insert(row.as_ref().map(|r| r.version));
        Ok(row.map(|r| r.value))
    }

    async fn read<T: DeserializeOwned>(&mut self, path: String) -> Result<Option<T>, KmsError> {
        match self.read_raw(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&mut self, path: String, value: &T) -> Result<(), KmsError> {
        self.writes.insert(path, Some(serde_json::to_vec(value)?));
        Ok(())
    }

    fn remove(&mut self, path: String) {
        self.writes.insert(path, None);
    }

    /// Lists paths under `prefix`, including staged writes.
    async fn list(&mut self, prefix: &str) -> Result<Vec<String>, KmsError> {
        let mut paths = self.store.call(self.store.backend.list(prefix)).await?;
        for (path, value) in self.writes.range(prefix.to_string()..) {
            if !path.starts_with(prefix) {
                break;
            }
            match value {
                Some(_) if !paths.contains(path) => paths.push(path.clone()),
                None => paths.retain(|p| p != path),
                _ => {},
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Whether the transaction has staged writes.
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Commits every staged write atomically.
    ///
    /// Fails with [`KmsError::Conflict`] if any row read by this transaction
    /// changed in the meantime.
    pub async fn commit(self) -> Result<(), KmsError> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let precondition = |version: &Option<u64>| match version {
            Some(v) => Precondition::Version(*v),
            None => Precondition::Absent,
        };

        let mut batch = WriteBatch::new();
        for (path, version) in &self.reads {
            if !self.writes.contains_key(path) {
                batch.check(path.clone(), precondition(version));
            }
        }
        for (path, value) in self.writes {
            let pre = self
                .reads
                .get(&path)
                .map_or(Precondition::None, precondition);
            match value {
                Some(bytes) => batch.put_if(path, bytes, pre),
                None => batch.delete_if(path, pre),
            };
        }

        debug!(entries = batch.len(), "Committing transaction");
        self.store.call(self.store.backend.commit(batch)).await
    }

    // ========================================================================
    // Keys and versions
    // ========================================================================

    /// Key record in this store's region.
    pub async fn get_key(&mut self, key_id: &str) -> Result<Option<Key>, KmsError> {
        let region = self.store.region.clone();
        self.get_key_in(&region, key_id).await
    }

    /// Key record in any region.
    pub async fn get_key_in(&mut self, region: &str, key_id: &str) -> Result<Option<Key>, KmsError> {
        self.read(paths::key(region, key_id)).await
    }

    /// Key record in this region, or `NotFound`.
    pub async fn require_key(&mut self, key_id: &str) -> Result<Key, KmsError> {
        self.get_key(key_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("key {key_id} does not exist")))
    }

    /// Stages a key record under its own region.
    pub fn put_key(&mut self, key: &Key) -> Result<(), KmsError> {
        self.write(paths::key(&key.region, &key.key_id), key)
    }

    /// Stages removal of a key record.
    pub fn delete_key(&mut self, key: &Key) {
        self.remove(paths::key(&key.region, &key.key_id));
    }

    /// Claims the quota guard of `scope` before a create counts against a
    /// limit.
    ///
    /// Listings are not part of the read set, so the guard row is read and
    /// rewritten instead: two transactions counting the same scope cannot
    /// both commit.
    pub async fn guard_quota(&mut self, scope: &str) -> Result<(), KmsError> {
        let path = paths::quota(&self.store.region, scope);
        let generation: u64 = self.read(path.clone()).await?.unwrap_or(0);
        self.write(path, &generation.wrapping_add(1))
    }

    /// Ids of every key in this region.
    pub async fn list_key_ids(&mut self) -> Result<Vec<String>, KmsError> {
        let prefix = paths::keys(&self.store.region);
        Ok(self.list(&prefix).await?.iter().map(|p| leaf(p)).collect())
    }

    /// One version of a key.
    pub async fn get_version(
        &mut self,
        region: &str,
        key_id: &str,
        version: u32,
    ) -> Result<Option<KeyVersion>, KmsError> {
        self.read(paths::version(region, key_id, version)).await
    }

    /// Stages a version.
    pub fn put_version(&mut self, region: &str, version: &KeyVersion) -> Result<(), KmsError> {
        self.write(paths::version(region, &version.key_id, version.version), version)
    }

    /// Every version of a key, oldest first.
    pub async fn list_versions(
        &mut self,
        region: &str,
        key_id: &str,
    ) -> Result<Vec<KeyVersion>, KmsError> {
        let mut versions = Vec::new();
        for path in self.list(&paths::versions(region, key_id)).await? {
            if let Some(version) = self.read(path).await? {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Stages removal of every version of a key.
    pub async fn delete_versions(&mut self, region: &str, key_id: &str) -> Result<(), KmsError> {
        for path in self.list(&paths::versions(region, key_id)).await? {
            self.remove(path);
        }
        Ok(())
    }

    // ========================================================================
    // Grants
    // ========================================================================

    /// A grant by id.
    pub async fn get_grant(&mut self, grant_id: &str) -> Result<Option<Grant>, KmsError> {
        let path = paths::grant(&self.store.region, grant_id);
        self.read(path).await
    }

    /// Stages a grant and its index entries.
    pub fn put_grant(&mut self, grant: &Grant) -> Result<(), KmsError> {
        let region = self.store.region.clone();
        self.write(paths::grant(&region, &grant.grant_id), grant)?;
        self.write(
            paths::grant_by_key(&region, &grant.key_id, &grant.grant_id),
            &grant.grant_id,
        )?;
        if let Some(retiree) = &grant.retiring_principal {
            self.write(
                paths::grant_by_retiree(&region, retiree, &grant.grant_id),
                &grant.grant_id,
            )?;
        }
        Ok(())
    }

    /// Stages removal of a grant and leaves a tombstone so its token stops
    /// authorizing.
    pub fn delete_grant(&mut self, grant: &Grant, now: u64) -> Result<(), KmsError> {
        let region = self.store.region.clone();
        self.remove(paths::grant(&region, &grant.grant_id));
        self.remove(paths::grant_by_key(&region, &grant.key_id, &grant.grant_id));
        if let Some(retiree) = &grant.retiring_principal {
            self.remove(paths::grant_by_retiree(&region, retiree, &grant.grant_id));
        }
        self.write(
            paths::grant_revoked(&region, &grant.grant_id),
            &GrantTombstone {
                grant_id: grant.grant_id.clone(),
                removed_at: now,
            },
        )
    }

    /// Whether a grant was revoked or retired.
    pub async fn is_grant_removed(&mut self, grant_id: &str) -> Result<bool, KmsError> {
        let path = paths::grant_revoked(&self.store.region, grant_id);
        Ok(self.read_raw(path).await?.is_some())
    }

    /// Grants attached to a key.
    pub async fn grants_for_key(&mut self, key_id: &str) -> Result<Vec<Grant>, KmsError> {
        let prefix = paths::grants_by_key(&self.store.region, key_id);
        self.load_grants(&prefix).await
    }

    /// Grants naming `principal` as retiring principal.
    pub async fn grants_for_retiree(&mut self, principal: &str) -> Result<Vec<Grant>, KmsError> {
        let prefix = paths::grants_by_retiree(&self.store.region, principal);
        let grants = self.load_grants(&prefix).await?;
        Ok(grants
            .into_iter()
            .filter(|g| g.retiring_principal.as_deref() == Some(principal))
            .collect())
    }

    async fn load_grants(&mut self, index_prefix: &str) -> Result<Vec<Grant>, KmsError> {
        let mut grants = Vec::new();
        for path in self.list(index_prefix).await? {
            if let Some(grant) = self.get_grant(&leaf(&path)).await? {
                grants.push(grant);
            }
        }
        Ok(grants)
    }

    // ========================================================================
    // Aliases
    // ========================================================================

    /// An alias by name.
    pub async fn get_alias(&mut self, name: &str) -> Result<Option<Alias>, KmsError> {
        let path = paths::alias(&self.store.region, name);
        self.read(path).await
    }

    /// Stages an alias.
    pub fn put_alias(&mut self, alias: &Alias) -> Result<(), KmsError> {
        let path = paths::alias(&self.store.region, &alias.name);
        self.write(path, alias)
    }

    /// Stages removal of an alias.
    pub fn delete_alias(&mut self, name: &str) {
        let path = paths::alias(&self.store.region, name);
        self.remove(path);
    }

    /// Every alias in this region.
    pub async fn list_aliases(&mut self) -> Result<Vec<Alias>, KmsError> {
        let mut aliases = Vec::new();
        for path in self.list(&paths::aliases(&self.store.region)).await? {
            if let Some(alias) = self.read(path).await? {
                aliases.push(alias);
            }
        }
        Ok(aliases)
    }

    // ========================================================================
    // Policies and tags
    // ========================================================================

    /// The key's `default` policy document.
    pub async fn get_policy(&mut self, key_id: &str) -> Result<Option<String>, KmsError> {
        let path = paths::policy(&self.store.region, key_id);
        self.read(path).await
    }

    /// Stages a policy document for a key in `region`.
    pub fn put_policy(&mut self, region: &str, key_id: &str, document: &str) -> Result<(), KmsError> {
        self.write(paths::policy(region, key_id), &document)
    }

    /// Stages removal of a key's policy.
    pub fn delete_policy(&mut self, region: &str, key_id: &str) {
        self.remove(paths::policy(region, key_id));
    }

    /// Tags of a key, sorted by tag key.
    pub async fn list_tags(&mut self, region: &str, key_id: &str) -> Result<Vec<Tag>, KmsError> {
        let mut tags = Vec::new();
        for path in self.list(&paths::tags(region, key_id)).await? {
            if let Some(tag) = self.read(path).await? {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    /// Stages a tag.
    pub fn put_tag(&mut self, region: &str, key_id: &str, tag: &Tag) -> Result<(), KmsError> {
        self.write(paths::tag(region, key_id, &tag.tag_key), tag)
    }

    /// Stages removal of a tag.
    pub fn delete_tag(&mut self, region: &str, key_id: &str, tag_key: &str) {
        self.remove(paths::tag(region, key_id, tag_key));
    }

    // ========================================================================
    // Identity policies
    // ========================================================================

    /// Identity policy documents attached to a principal.
    pub async fn identity_policies(&mut self, principal: &str) -> Result<Vec<String>, KmsError> {
        let prefix = paths::identity_policies(principal);
        let mut documents = Vec::new();
        for path in self.list(&prefix).await? {
            // Only direct children belong to this principal.
            if path.strip_prefix(&prefix).map_or(true, |rest| rest.contains('/')) {
                continue;
            }
            if let Some(document) = self.read(path).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    /// Stages an identity policy.
    pub fn put_identity_policy(
        &mut self,
        principal: &str,
        name: &str,
        document: &str,
    ) -> Result<(), KmsError> {
        self.write(paths::identity_policy(principal, name), &document)
    }

    /// Stages removal of an identity policy.
    pub fn delete_identity_policy(&mut self, principal: &str, name: &str) {
        self.remove(paths::identity_policy(principal, name));
    }
}
