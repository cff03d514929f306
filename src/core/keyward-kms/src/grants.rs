//! Grant registry.
//!
//! Grants are persisted through the [`Txn`] like every other record, but the
//! authorization path sees them in two ways:
//!
//! - through a **grant token**, which carries the whole grant and an HMAC
//!   over it, so a freshly created grant authorizes immediately;
//! - by **id lookup**, which only sees grants older than the configured
//!   propagation delay.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tracing::{debug, info};
use zeroize::Zeroizing;

use keyward_crypto::aead::KEY_SIZE;
use keyward_crypto::mac::{self, MacHash};
use keyward_crypto::{kdf, random, MasterKey};

use crate::config::KmsConfig;
use crate::error::KmsError;
use crate::model::{Grant, GrantConstraints, Key, Operation};
use crate::page::{paginate, Page};
use crate::store::Txn;

const TOKEN_LABEL: &str = "keyward-grant-token-v1";
const MAX_TOKEN_LEN: usize = 8192;
const MAX_GRANT_NAME_LEN: usize = 256;

/// Parameters of a new grant.
#[derive(Debug, Clone)]
pub struct NewGrant {
    /// Principal receiving the permissions.
    pub grantee_principal: String,
    /// Principal allowed to retire the grant.
    pub retiring_principal: Option<String>,
    /// Delegated operations.
    pub operations: Vec<Operation>,
    /// Encryption context constraints.
    pub constraints: Option<GrantConstraints>,
    /// Client-chosen name for idempotent retries.
    pub name: Option<String>,
}

/// Filters accepted by [`GrantRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct GrantFilter {
    /// Only the grant with this id.
    pub grant_id: Option<String>,
    /// Only grants for this grantee.
    pub grantee_principal: Option<String>,
}

/// How RetireGrant names its target.
#[derive(Debug, Clone)]
pub enum RetireTarget {
    /// The token returned by CreateGrant.
    Token(String),
    /// Key id plus grant id.
    Id {
        /// Key the grant belongs to.
        key_id: String,
        /// Grant to retire.
        grant_id: String,
    },
}

/// Creates, resolves and removes grants.
pub struct GrantRegistry {
    token_key: Zeroizing<[u8; KEY_SIZE]>,
    propagation_delay: u64,
    max_grants_per_key: usize,
}

impl GrantRegistry {
    /// Creates a registry whose tokens are authenticated under a subkey of
    /// `master_key`.
    pub fn new(master_key: &MasterKey, config: &KmsConfig) -> Result<Self, KmsError> {
        Ok(Self {
            token_key: kdf::derive_subkey(master_key.as_bytes(), &[TOKEN_LABEL])?,
            propagation_delay: config.grant_propagation_delay_secs,
            max_grants_per_key: config.max_grants_per_key,
        })
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Issues a token carrying `grant`.
    pub fn issue_token(&self, grant: &Grant) -> Result<String, KmsError> {
        let payload = serde_json::to_vec(grant)?;
        let tag = mac::compute(MacHash::Sha256, &*self.token_key, &payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Verifies a token and returns the grant it carries.
    pub fn decode_token(&self, token: &str) -> Result<Grant, KmsError> {
        let invalid = || KmsError::InvalidGrantToken("token is malformed".into());

        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(invalid());
        }
        let (payload, tag) = token.split_once('.').ok_or_else(invalid)?;
        let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| invalid())?;

        if !mac::verify(MacHash::Sha256, &*self.token_key, &payload, &tag)? {
            return Err(KmsError::InvalidGrantToken(
                "token failed verification".into(),
            ));
        }
        serde_json::from_slice(&payload).map_err(|_| invalid())
    }

    /// Resolves presented tokens to the grants usable on `key_id`.
    ///
    /// Tokens for other keys and tokens of removed grants are ignored; a
    /// forged token is an error.
    pub async fn resolve_tokens(
        &self,
        txn: &mut Txn<'_>,
        tokens: &[String],
        key_id: &str,
    ) -> Result<Vec<Grant>, KmsError> {
        let mut grants = Vec::new();
        for token in tokens {
            let grant = self.decode_token(token)?;
            if grant.key_id != key_id {
                debug!(grant_id = %grant.grant_id, key_id, "Grant token is for another key");
                continue;
            }
            if txn.is_grant_removed(&grant.grant_id).await? {
                debug!(grant_id = %grant.grant_id, "Grant token refers to a removed grant");
                continue;
            }
            grants.push(grant);
        }
        Ok(grants)
    }

    /// Grants on `key_id` that id lookups can see at `now`.
    pub async fn visible_grants(
        &self,
        txn: &mut Txn<'_>,
        key_id: &str,
        now: u64,
    ) -> Result<Vec<Grant>, KmsError> {
        let grants = txn.grants_for_key(key_id).await?;
        Ok(grants
            .into_iter()
            .filter(|g| g.created_at.saturating_add(self.propagation_delay) <= now)
            .collect())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Stages a grant on `key` and returns it with its token.
    ///
    /// Repeating a named grant with identical parameters returns the existing
    /// grant instead of creating a second one.
    pub async fn create(
        &self,
        txn: &mut Txn<'_>,
        key: &Key,
        request: NewGrant,
        issuing_principal: &str,
        now: u64,
    ) -> Result<(Grant, String), KmsError> {
        validate_new_grant(key, &request)?;

        txn.guard_quota(&format!("grants/{}", key.key_id)).await?;
        let existing = txn.grants_for_key(&key.key_id).await?;
        if let Some(name) = &request.name {
            let same = existing.iter().find(|g| {
                g.name.as_ref() == Some(name)
                    && g.grantee_principal == request.grantee_principal
                    && g.retiring_principal == request.retiring_principal
                    && same_operations(&g.operations, &request.operations)
                    && g.constraints == request.constraints
            });
            if let Some(grant) = same {
                debug!(grant_id = %grant.grant_id, "Returning existing grant for retried name");
                let token = self.issue_token(grant)?;
                return Ok((grant.clone(), token));
            }
        }

        if existing.len() >= self.max_grants_per_key {
            return Err(KmsError::LimitExceeded(format!(
                "key {} already has {} grants",
                key.key_id,
                existing.len()
            )));
        }

        let mut operations = request.operations;
        operations.sort();
        operations.dedup();

        let grant = Grant {
            grant_id: hex::encode(random::generate_bytes(32)),
            key_id: key.key_id.clone(),
            name: request.name,
            grantee_principal: request.grantee_principal,
            retiring_principal: request.retiring_principal,
            issuing_principal: issuing_principal.to_string(),
            operations,
            constraints: request.constraints,
            created_at: now,
        };
        txn.put_grant(&grant)?;
        let token = self.issue_token(&grant)?;

        info!(
            key_id = %key.key_id,
            grant_id = %grant.grant_id,
            grantee = %grant.grantee_principal,
            "Grant created"
        );
        Ok((grant, token))
    }

    /// Stages retirement of a grant by `caller`.
    ///
    /// Allowed for the retiring principal, the grantee when the grant
    /// delegates RetireGrant, and the root of the account that issued it.
    pub async fn retire(
        &self,
        txn: &mut Txn<'_>,
        target: RetireTarget,
        caller: &str,
        now: u64,
    ) -> Result<Grant, KmsError> {
        let grant_id = match target {
            RetireTarget::Token(token) => self.decode_token(&token)?.grant_id,
            RetireTarget::Id { key_id, grant_id } => {
                let grant = txn.get_grant(&grant_id).await?;
                if grant.as_ref().is_some_and(|g| g.key_id != key_id) {
                    return Err(KmsError::NotFound(format!(
                        "grant {grant_id} does not belong to key {key_id}"
                    )));
                }
                grant_id
            },
        };

        let grant = txn
            .get_grant(&grant_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("grant {grant_id} does not exist")))?;

        if !may_retire(&grant, caller) {
            return Err(KmsError::AccessDenied(format!(
                "{caller} may not retire grant {grant_id}"
            )));
        }

        txn.delete_grant(&grant, now)?;
        info!(key_id = %grant.key_id, grant_id = %grant.grant_id, "Grant retired");
        Ok(grant)
    }

    /// Stages revocation of a grant on `key_id`.
    pub async fn revoke(
        &self,
        txn: &mut Txn<'_>,
        key_id: &str,
        grant_id: &str,
        now: u64,
    ) -> Result<Grant, KmsError> {
        let grant = txn
            .get_grant(grant_id)
            .await?
            .filter(|g| g.key_id == key_id)
            .ok_or_else(|| {
                KmsError::NotFound(format!("grant {grant_id} does not exist on key {key_id}"))
            })?;

        txn.delete_grant(&grant, now)?;
        info!(key_id, grant_id, "Grant revoked");
        Ok(grant)
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Grants on a key, one page at a time.
    pub async fn list(
        &self,
        txn: &mut Txn<'_>,
        key_id: &str,
        filter: &GrantFilter,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Page<Grant>, KmsError> {
        let grants: Vec<Grant> = txn
            .grants_for_key(key_id)
            .await?
            .into_iter()
            .filter(|g| filter.grant_id.as_ref().map_or(true, |id| &g.grant_id == id))
            .filter(|g| {
                filter
                    .grantee_principal
                    .as_ref()
                    .map_or(true, |p| &g.grantee_principal == p)
            })
            .collect();
        paginate(grants, |g| g.grant_id.clone(), marker, limit)
    }

    /// Grants that `principal` may retire, one page at a time.
    pub async fn list_retirable(
        &self,
        txn: &mut Txn<'_>,
        principal: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Page<Grant>, KmsError> {
        let grants = txn.grants_for_retiree(principal).await?;
        paginate(
            grants,
            |g| format!("{}/{}", g.key_id, g.grant_id),
            marker,
            limit,
        )
    }
}

fn same_operations(a: &[Operation], b: &[Operation]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

fn validate_new_grant(key: &Key, request: &NewGrant) -> Result<(), KmsError> {
    if request.grantee_principal.is_empty() {
        return Err(KmsError::Validation("grantee principal is required".into()));
    }
    if request.operations.is_empty() {
        return Err(KmsError::Validation("a grant needs at least one operation".into()));
    }
    if let Some(name) = &request.name {
        if name.is_empty()
            || name.len() > MAX_GRANT_NAME_LEN
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '/' | '_' | '-'))
        {
            return Err(KmsError::Validation(format!("invalid grant name: {name}")));
        }
    }
    for op in &request.operations {
        if !op.is_grantable() {
            return Err(KmsError::Validation(format!("{op} cannot be granted")));
        }
        if !op.compatible_with(key.key_usage) {
            return Err(KmsError::Validation(format!(
                "{op} is not valid for a {} key",
                key.key_usage
            )));
        }
    }
    if let Some(constraints) = &request.constraints {
        if constraints.encryption_context_equals.is_some()
            && constraints.encryption_context_subset.is_some()
        {
            return Err(KmsError::Validation(
                "EncryptionContextEquals and EncryptionContextSubset are exclusive".into(),
            ));
        }
        if !key.key_spec.is_symmetric() {
            return Err(KmsError::Validation(
                "encryption context constraints require a symmetric key".into(),
            ));
        }
    }
    Ok(())
}

fn may_retire(grant: &Grant, caller: &str) -> bool {
    if grant.retiring_principal.as_deref() == Some(caller) {
        return true;
    }
    if grant.grantee_principal == caller && grant.operations.contains(&Operation::RetireGrant) {
        return true;
    }
    let issuing_account = crate::model::principal_account(&grant.issuing_principal);
    match (issuing_account, caller.strip_suffix(":root")) {
        (Some(account), Some(prefix)) => prefix.ends_with(&format!(":{account}")),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::model::{KeySpec, KeyState, KeyUsage, Origin, RotationSettings};
    use crate::store::KeyStore;
    use keyward_storage::MemoryBackend;
    use std::sync::Arc;
    use std::time::Duration;

    const ROOT: &str = "arn:keyward:iam::111122223333:root";
    const APP: &str = "arn:keyward:iam::111122223333:role/app";
    const OPS: &str = "arn:keyward:iam::111122223333:role/ops";

    fn setup() -> (KeyStore, GrantRegistry, Key) {
        let master = MasterKey::from_bytes(&[1u8; 32]).unwrap();
        let config = KmsConfig {
            max_grants_per_key: 3,
            ..KmsConfig::default()
        };
        let registry = GrantRegistry::new(&master, &config).unwrap();
        let store = KeyStore::new(
            Arc::new(MemoryBackend::new()),
            master,
            "us-east-1",
            Duration::from_secs(5),
        );
        let key = Key {
            key_id: "k1".into(),
            region: "us-east-1".into(),
            account_id: "111122223333".into(),
            description: String::new(),
            key_spec: KeySpec::SymmetricDefault,
            key_usage: KeyUsage::EncryptDecrypt,
            origin: Origin::ServiceGenerated,
            custom_key_store_id: None,
            state: KeyState::Enabled,
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
        };
        (store, registry, key)
    }

    fn decrypt_grant() -> NewGrant {
        NewGrant {
            grantee_principal: APP.into(),
            retiring_principal: Some(OPS.into()),
            operations: vec![Operation::Decrypt],
            constraints: None,
            name: None,
        }
    }

    #[tokio::test]
    async fn test_token_authorizes_before_propagation() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        let (grant, token) = registry
            .create(&mut txn, &key, decrypt_grant(), ROOT, 1_000)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        assert!(registry.visible_grants(&mut txn, "k1", 1_000).await.unwrap().is_empty());
        let resolved = registry
            .resolve_tokens(&mut txn, &[token.clone()], "k1")
            .await
            .unwrap();
        assert_eq!(resolved, vec![grant.clone()]);

        let later = registry.visible_grants(&mut txn, "k1", 1_180).await.unwrap();
        assert_eq!(later, vec![grant]);

        assert!(registry
            .resolve_tokens(&mut txn, &[token], "other-key")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_forged_token_rejected() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        let (mut grant, token) = registry
            .create(&mut txn, &key, decrypt_grant(), ROOT, 0)
            .await
            .unwrap();

        let (_, tag) = token.split_once('.').unwrap();
        grant.operations.push(Operation::Encrypt);
        let forged = format!(
            "{}.{tag}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&grant).unwrap())
        );
        assert!(matches!(
            registry.decode_token(&forged),
            Err(KmsError::InvalidGrantToken(_))
        ));
        assert!(matches!(
            registry.decode_token("garbage"),
            Err(KmsError::InvalidGrantToken(_))
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_stops_resolving() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        let (grant, token) = registry
            .create(&mut txn, &key, decrypt_grant(), ROOT, 0)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        registry.revoke(&mut txn, "k1", &grant.grant_id, 5).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        assert!(registry
            .resolve_tokens(&mut txn, &[token], "k1")
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            registry.revoke(&mut txn, "k1", &grant.grant_id, 6).await,
            Err(KmsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_named_grant_is_idempotent() {
        let (store, registry, key) = setup();
        let named = NewGrant {
            name: Some("app-decrypt".into()),
            ..decrypt_grant()
        };

        let mut txn = store.begin();
        let (first, _) = registry.create(&mut txn, &key, named.clone(), ROOT, 0).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        let (second, _) = registry.create(&mut txn, &key, named.clone(), ROOT, 9).await.unwrap();
        assert_eq!(first.grant_id, second.grant_id);
        assert!(!txn.is_dirty());

        let different = NewGrant {
            operations: vec![Operation::Decrypt, Operation::Encrypt],
            ..named
        };
        let (third, _) = registry.create(&mut txn, &key, different, ROOT, 9).await.unwrap();
        assert_ne!(first.grant_id, third.grant_id);
    }

    #[tokio::test]
    async fn test_grant_validation_and_limit() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();

        let sign = NewGrant {
            operations: vec![Operation::Sign],
            ..decrypt_grant()
        };
        assert!(matches!(
            registry.create(&mut txn, &key, sign, ROOT, 0).await,
            Err(KmsError::Validation(_))
        ));
        let admin = NewGrant {
            operations: vec![Operation::ScheduleKeyDeletion],
            ..decrypt_grant()
        };
        assert!(registry.create(&mut txn, &key, admin, ROOT, 0).await.is_err());
        let empty = NewGrant {
            operations: vec![],
            ..decrypt_grant()
        };
        assert!(registry.create(&mut txn, &key, empty, ROOT, 0).await.is_err());

        for _ in 0..3 {
            registry.create(&mut txn, &key, decrypt_grant(), ROOT, 0).await.unwrap();
        }
        assert!(matches!(
            registry.create(&mut txn, &key, decrypt_grant(), ROOT, 0).await,
            Err(KmsError::LimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_retire_permissions() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        let (grant, token) = registry
            .create(&mut txn, &key, decrypt_grant(), ROOT, 0)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        let stranger = "arn:keyward:iam::444455556666:root";
        assert!(matches!(
            registry
                .retire(&mut txn, RetireTarget::Token(token.clone()), stranger, 1)
                .await,
            Err(KmsError::AccessDenied(_))
        ));
        assert!(matches!(
            registry.retire(&mut txn, RetireTarget::Token(token.clone()), APP, 1).await,
            Err(KmsError::AccessDenied(_))
        ));

        registry
            .retire(&mut txn, RetireTarget::Token(token), OPS, 1)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        assert!(matches!(
            registry
                .retire(
                    &mut txn,
                    RetireTarget::Id {
                        key_id: "k1".into(),
                        grant_id: grant.grant_id
                    },
                    ROOT,
                    2
                )
                .await,
            Err(KmsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_account_root_and_self_retire() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        let (by_root, _) = registry
            .create(&mut txn, &key, decrypt_grant(), ROOT, 0)
            .await
            .unwrap();
        let self_retire = NewGrant {
            retiring_principal: None,
            operations: vec![Operation::Decrypt, Operation::RetireGrant],
            ..decrypt_grant()
        };
        let (by_self, _) = registry.create(&mut txn, &key, self_retire, ROOT, 0).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        registry
            .retire(
                &mut txn,
                RetireTarget::Id {
                    key_id: "k1".into(),
                    grant_id: by_root.grant_id,
                },
                ROOT,
                1,
            )
            .await
            .unwrap();
        registry
            .retire(
                &mut txn,
                RetireTarget::Id {
                    key_id: "k1".into(),
                    grant_id: by_self.grant_id,
                },
                APP,
                1,
            )
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pages_and_filters() {
        let (store, registry, key) = setup();
        let mut txn = store.begin();
        registry.create(&mut txn, &key, decrypt_grant(), ROOT, 0).await.unwrap();
        registry.create(&mut txn, &key, decrypt_grant(), ROOT, 0).await.unwrap();
        let other = NewGrant {
            grantee_principal: OPS.into(),
            retiring_principal: None,
            ..decrypt_grant()
        };
        registry.create(&mut txn, &key, other, ROOT, 0).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        let first = registry
            .list(&mut txn, "k1", &GrantFilter::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let rest = registry
            .list(
                &mut txn,
                "k1",
                &GrantFilter::default(),
                first.next_marker.as_deref(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.truncated());

        let filter = GrantFilter {
            grantee_principal: Some(OPS.into()),
            ..GrantFilter::default()
        };
        let page = registry.list(&mut txn, "k1", &filter, None, 10).await.unwrap();
        assert_eq!(page.items.len(), 1);

        let retirable = registry.list_retirable(&mut txn, OPS, None, 10).await.unwrap();
        assert_eq!(retirable.items.len(), 2);
    }
}
