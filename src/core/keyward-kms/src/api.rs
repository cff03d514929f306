//! JSON dispatch of operations by name.
//!
//! Transports hand over an operation name, the caller and a JSON body; the
//! dispatcher decodes the body into the operation's request type, runs it and
//! encodes the response. Errors become `{"__type": ..., "message": ...}`
//! bodies with an HTTP-style status.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{ErrorKind, KmsError};
use crate::service::{Caller, Kms};

/// Every operation name [`dispatch`] accepts.
pub const OPERATIONS: &[&str] = &[
    "CreateKey",
    "DescribeKey",
    "EnableKey",
    "DisableKey",
    "ScheduleKeyDeletion",
    "CancelKeyDeletion",
    "UpdateKeyDescription",
    "ListKeys",
    "EnableKeyRotation",
    "DisableKeyRotation",
    "GetKeyRotationStatus",
    "RotateKeyOnDemand",
    "ListKeyRotations",
    "GetParametersForImport",
    "ImportKeyMaterial",
    "DeleteImportedKeyMaterial",
    "Encrypt",
    "Decrypt",
    "ReEncrypt",
    "GenerateDataKey",
    "GenerateDataKeyWithoutPlaintext",
    "GenerateDataKeyPair",
    "GenerateDataKeyPairWithoutPlaintext",
    "GenerateRandom",
    "Sign",
    "Verify",
    "GenerateMac",
    "VerifyMac",
    "DeriveSharedSecret",
    "GetPublicKey",
    "CreateGrant",
    "ListGrants",
    "ListRetirableGrants",
    "RetireGrant",
    "RevokeGrant",
    "GetKeyPolicy",
    "PutKeyPolicy",
    "ListKeyPolicies",
    "CreateAlias",
    "UpdateAlias",
    "DeleteAlias",
    "ListAliases",
    "TagResource",
    "UntagResource",
    "ListResourceTags",
    "ReplicateKey",
    "UpdatePrimaryRegion",
];

async fn call<Req, Resp, Fut>(body: Value, run: impl FnOnce(Req) -> Fut) -> Result<Value, KmsError>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    Fut: Future<Output = Result<Resp, KmsError>>,
{
    let body = match body {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let request: Req = serde_json::from_value(body)
        .map_err(|e| KmsError::Validation(format!("malformed request: {e}")))?;
    let response = run(request).await?;
    Ok(serde_json::to_value(response)?)
}

/// Runs `operation` for `caller` with a JSON `body`.
pub async fn dispatch(
    kms: &Kms,
    caller: &Caller,
    operation: &str,
    body: Value,
) -> Result<Value, KmsError> {
    debug!(operation, principal = caller.principal(), "Dispatching");
    match operation {
        "CreateKey" => call(body, |r| kms.create_key(caller, r)).await,
        "DescribeKey" => call(body, |r| kms.describe_key(caller, r)).await,
        "EnableKey" => call(body, |r| kms.enable_key(caller, r)).await,
        "DisableKey" => call(body, |r| kms.disable_key(caller, r)).await,
        "ScheduleKeyDeletion" => call(body, |r| kms.schedule_key_deletion(caller, r)).await,
        "CancelKeyDeletion" => call(body, |r| kms.cancel_key_deletion(caller, r)).await,
        "UpdateKeyDescription" => call(body, |r| kms.update_key_description(caller, r)).await,
        "ListKeys" => call(body, |r| kms.list_keys(caller, r)).await,

        "EnableKeyRotation" => call(body, |r| kms.enable_key_rotation(caller, r)).await,
        "DisableKeyRotation" => call(body, |r| kms.disable_key_rotation(caller, r)).await,
        "GetKeyRotationStatus" => call(body, |r| kms.get_key_rotation_status(caller, r)).await,
        "RotateKeyOnDemand" => call(body, |r| kms.rotate_key_on_demand(caller, r)).await,
        "ListKeyRotations" => call(body, |r| kms.list_key_rotations(caller, r)).await,

        "GetParametersForImport" => {
            call(body, |r| kms.get_parameters_for_import(caller, r)).await
        },
        "ImportKeyMaterial" => call(body, |r| kms.import_key_material(caller, r)).await,
        "DeleteImportedKeyMaterial" => {
            call(body, |r| kms.delete_imported_key_material(caller, r)).await
        },

        "Encrypt" => call(body, |r| kms.encrypt(caller, r)).await,
        "Decrypt" => call(body, |r| kms.decrypt(caller, r)).await,
        "ReEncrypt" => call(body, |r| kms.re_encrypt(caller, r)).await,
        "GenerateDataKey" => call(body, |r| kms.generate_data_key(caller, r)).await,
        "GenerateDataKeyWithoutPlaintext" => {
            call(body, |r| kms.generate_data_key_without_plaintext(caller, r)).await
        },
        "GenerateDataKeyPair" => call(body, |r| kms.generate_data_key_pair(caller, r)).await,
        "GenerateDataKeyPairWithoutPlaintext" => {
            call(body, |r| {
                kms.generate_data_key_pair_without_plaintext(caller, r)
            })
            .await
        },
        "GenerateRandom" => call(body, |r| kms.generate_random(caller, r)).await,
        "Sign" => call(body, |r| kms.sign(caller, r)).await,
        "Verify" => call(body, |r| kms.verify(caller, r)).await,
        "GenerateMac" => call(body, |r| kms.generate_mac(caller, r)).await,
        "VerifyMac" => call(body, |r| kms.verify_mac(caller, r)).await,
        "DeriveSharedSecret" => call(body, |r| kms.derive_shared_secret(caller, r)).await,
        "GetPublicKey" => call(body, |r| kms.get_public_key(caller, r)).await,

        "CreateGrant" => call(body, |r| kms.create_grant(caller, r)).await,
        "ListGrants" => call(body, |r| kms.list_grants(caller, r)).await,
        "ListRetirableGrants" => call(body, |r| kms.list_retirable_grants(caller, r)).await,
        "RetireGrant" => call(body, |r| kms.retire_grant(caller, r)).await,
        "RevokeGrant" => call(body, |r| kms.revoke_grant(caller, r)).await,

        "GetKeyPolicy" => call(body, |r| kms.get_key_policy(caller, r)).await,
        "PutKeyPolicy" => call(body, |r| kms.put_key_policy(caller, r)).await,
        "ListKeyPolicies" => call(body, |r| kms.list_key_policies(caller, r)).await,

        "CreateAlias" => call(body, |r| kms.create_alias(caller, r)).await,
        "UpdateAlias" => call(body, |r| kms.update_alias(caller, r)).await,
        "DeleteAlias" => call(body, |r| kms.delete_alias(caller, r)).await,
        "ListAliases" => call(body, |r| kms.list_aliases(caller, r)).await,

        "TagResource" => call(body, |r| kms.tag_resource(caller, r)).await,
        "UntagResource" => call(body, |r| kms.untag_resource(caller, r)).await,
        "ListResourceTags" => call(body, |r| kms.list_resource_tags(caller, r)).await,

        "ReplicateKey" => call(body, |r| kms.replicate_key(caller, r)).await,
        "UpdatePrimaryRegion" => call(body, |r| kms.update_primary_region(caller, r)).await,

        other => Err(KmsError::UnsupportedOperation(format!(
            "unknown operation: {other}"
        ))),
    }
}

/// HTTP status for an error kind.
pub fn http_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::AccessDenied => 403,
        ErrorKind::Conflict | ErrorKind::AlreadyExists => 409,
        ErrorKind::LimitExceeded => 429,
        ErrorKind::Internal => 500,
        ErrorKind::DependencyTimeout => 503,
        _ => 400,
    }
}

/// Error envelope returned to clients.
pub fn error_body(err: &KmsError) -> Value {
    let kind = err.kind();
    json!({
        "__type": kind.code(),
        "message": err.to_string(),
        "retryable": kind.is_retryable(),
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keyward_crypto::MasterKey;
    use keyward_storage::MemoryBackend;

    use crate::clock::ManualClock;
    use crate::config::KmsConfig;

    fn kms() -> Kms {
        Kms::new(
            KmsConfig::default(),
            Arc::new(MemoryBackend::new()),
            MasterKey::from_bytes(&[3u8; 32]).unwrap(),
            Arc::new(ManualClock::new(1_700_000_000)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_json_round_trip_through_dispatch() {
        let kms = kms();
        let root = kms.root_caller();

        let created = dispatch(&kms, &root, "CreateKey", Value::Null).await.unwrap();
        let key_id = created["KeyMetadata"]["KeyId"].as_str().unwrap().to_string();
        assert_eq!(created["KeyMetadata"]["KeyState"], "Enabled");

        let encrypted = dispatch(
            &kms,
            &root,
            "Encrypt",
            json!({
                "KeyId": key_id,
                "Plaintext": "c2VjcmV0",
                "EncryptionContext": {"tenant": "a"},
            }),
        )
        .await
        .unwrap();

        let decrypted = dispatch(
            &kms,
            &root,
            "Decrypt",
            json!({
                "CiphertextBlob": encrypted["CiphertextBlob"],
                "EncryptionContext": {"tenant": "a"},
            }),
        )
        .await
        .unwrap();
        assert_eq!(decrypted["Plaintext"], "c2VjcmV0");
    }

    #[tokio::test]
    async fn test_errors_carry_wire_codes() {
        let kms = kms();
        let root = kms.root_caller();

        let err = dispatch(&kms, &root, "DescribeKey", json!({"KeyId": "alias/none"}))
            .await
            .unwrap_err();
        let body = error_body(&err);
        assert_eq!(body["__type"], "NotFoundException");
        assert_eq!(http_status(err.kind()), 404);

        let err = dispatch(&kms, &root, "Encrypt", json!({"Plaintext": 42}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = dispatch(&kms, &root, "MakeCoffee", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_operation_names_are_unique() {
        let mut names = OPERATIONS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OPERATIONS.len());
    }
}
