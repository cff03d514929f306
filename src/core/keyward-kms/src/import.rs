//! Import of externally generated key material.
//!
//! GetParametersForImport hands out a fresh RSA wrapping public key and an
//! import token. The token is the sealed record of the wrapping private key,
//! the key it is bound to and its expiry, so the service keeps no state
//! between the two calls.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use keyward_crypto::aead::{self, KEY_SIZE};
use keyward_crypto::asymmetric;
use keyward_crypto::mac::{self, MacHash};
use keyward_crypto::{kdf, KeyMaterial, MasterKey};

use crate::config::KmsConfig;
use crate::error::KmsError;
use crate::model::{b64, Key, KeyState, Origin, WrappingAlgorithm, WrappingKeySpec};

const TOKEN_LABEL: &str = "keyward-import-token-v1";
const TOKEN_AAD: &[u8] = b"keyward-import-token";
const FINGERPRINT_LABEL: &str = "keyward-material-fingerprint-v1";

/// Length of importable symmetric material.
pub const IMPORTED_MATERIAL_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct TokenBody {
    key_id: String,
    algorithm: WrappingAlgorithm,
    #[serde(with = "b64")]
    wrapping_key: Vec<u8>,
    expires_at: u64,
}

/// What GetParametersForImport returns.
#[derive(Debug, Clone)]
pub struct ImportParameters {
    /// DER SubjectPublicKeyInfo of the wrapping key.
    pub public_key: Vec<u8>,
    /// Opaque token to present with ImportKeyMaterial.
    pub import_token: Vec<u8>,
    /// Token expiry.
    pub parameters_valid_to: u64,
}

/// Issues wrapping parameters and unwraps imported material.
pub struct ImportManager {
    token_key: Zeroizing<[u8; KEY_SIZE]>,
    master_key: MasterKey,
    validity_secs: u64,
}

impl ImportManager {
    /// Creates a manager sealing tokens under a subkey of `master_key`.
    pub fn new(master_key: &MasterKey, config: &KmsConfig) -> Result<Self, KmsError> {
        Ok(Self {
            token_key: kdf::derive_subkey(master_key.as_bytes(), &[TOKEN_LABEL])?,
            master_key: MasterKey::from_bytes(master_key.as_bytes())?,
            validity_secs: config.import_token_validity_secs,
        })
    }

    /// Generates a wrapping key pair and a token bound to `key`.
    pub fn parameters(
        &self,
        key: &Key,
        algorithm: WrappingAlgorithm,
        spec: WrappingKeySpec,
        now: u64,
    ) -> Result<ImportParameters, KmsError> {
        check_importable(key)?;
        if matches!(key.state, KeyState::PendingDeletion | KeyState::PendingReplicaDeletion) {
            return Err(KmsError::InvalidState(format!(
                "key {} is {}",
                key.key_id, key.state
            )));
        }

        let wrapping_key = asymmetric::generate_rsa(spec.bits())?;
        let public_key = asymmetric::rsa_public_key_der(&wrapping_key)?;
        let expires_at = now.saturating_add(self.validity_secs);

        let body = Zeroizing::new(serde_json::to_vec(&TokenBody {
            key_id: key.key_id.clone(),
            algorithm,
            wrapping_key: wrapping_key.to_vec(),
            expires_at,
        })?);
        let import_token = aead::seal(&*self.token_key, &body, TOKEN_AAD)?;

        debug!(key_id = %key.key_id, %algorithm, "Issued import parameters");
        Ok(ImportParameters {
            public_key,
            import_token,
            parameters_valid_to: expires_at,
        })
    }

    /// Opens a token and unwraps `encrypted_material` with it.
    pub fn unwrap_material(
        &self,
        key_id: &str,
        import_token: &[u8],
        encrypted_material: &[u8],
        now: u64,
    ) -> Result<KeyMaterial, KmsError> {
        let body = aead::open(&*self.token_key, import_token, TOKEN_AAD)
            .map_err(|_| KmsError::InvalidImportToken("import token is not valid".into()))?;
        let body: TokenBody = serde_json::from_slice(&body)
            .map_err(|_| KmsError::InvalidImportToken("import token is not valid".into()))?;
        let wrapping_key = Zeroizing::new(body.wrapping_key);

        if body.key_id != key_id {
            return Err(KmsError::InvalidImportToken(format!(
                "import token was issued for another key, not {key_id}"
            )));
        }
        if now > body.expires_at {
            return Err(KmsError::ExpiredImportToken);
        }

        let material =
            asymmetric::rsa_oaep_decrypt(&wrapping_key, body.algorithm.hash(), encrypted_material)
                .map_err(|_| {
                    KmsError::InvalidCiphertext(
                        "encrypted key material could not be unwrapped".into(),
                    )
                })?;
        if material.len() != IMPORTED_MATERIAL_LEN {
            return Err(KmsError::IncorrectKeyMaterial(format!(
                "symmetric key material must be {IMPORTED_MATERIAL_LEN} bytes, got {}",
                material.len()
            )));
        }
        Ok(KeyMaterial::from_slice(&material))
    }

    /// Stable identifier of material imported into `key_id`.
    pub fn fingerprint(&self, key_id: &str, material: &KeyMaterial) -> Result<String, KmsError> {
        let fp_key = kdf::derive_subkey(self.master_key.as_bytes(), &[FINGERPRINT_LABEL, key_id])?;
        Ok(hex::encode(mac::compute(
            MacHash::Sha256,
            &*fp_key,
            material.as_bytes(),
        )?))
    }
}

/// Checks that a key accepts imported material at all.
pub fn check_importable(key: &Key) -> Result<(), KmsError> {
    if key.origin != Origin::External {
        return Err(KmsError::UnsupportedOperation(format!(
            "key {} has origin {}; only EXTERNAL keys accept imported material",
            key.key_id, key.origin
        )));
    }
    Ok(())
}
