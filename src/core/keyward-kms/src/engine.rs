//! Cryptographic operations on key material.
//!
//! The engine is stateless: the service resolves and authorizes a key, opens
//! the material of the right version through the [`KeyStore`] and hands it
//! here. Nothing in this module reads or writes storage.
//!
//! Symmetric ciphertext blobs are self-describing:
//!
//! ```text
//! 0x01 | key_id_len:u8 | key_id | version:u32 BE | nonce(12) | ciphertext | tag(16)
//! ```
//!
//! The AEAD's associated data binds the key id, the version and the
//! canonical JSON of the encryption context, so decrypting under another key,
//! version or context fails authentication. Asymmetric ciphertexts are raw
//! RSA-OAEP output with no header.
//!
//! [`KeyStore`]: crate::store::KeyStore

use zeroize::Zeroizing;

use keyward_crypto::asymmetric::{self, EccCurve, HashAlgorithm};
use keyward_crypto::{aead, mac, random, CryptoError, KeyMaterial};

use crate::error::KmsError;
use crate::model::{
    EncryptionAlgorithm, EncryptionContext, Key, KeySpec, KeyUsage, MacAlgorithm, MessageType,
    SignatureScheme, SigningAlgorithm,
};

const BLOB_FORMAT: u8 = 0x01;
const BLOB_AAD_LABEL: &[u8] = b"keyward-blob-v1";

/// Largest plaintext accepted by symmetric Encrypt.
pub const MAX_SYMMETRIC_PLAINTEXT: usize = 4096;

/// Largest RAW message accepted by Sign, Verify and the MAC operations.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Accepted range for GenerateRandom and `NumberOfBytes`.
pub const RANDOM_BYTES_RANGE: std::ops::RangeInclusive<usize> = 1..=1024;

/// Header of a symmetric ciphertext blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    /// Key that produced the blob.
    pub key_id: String,
    /// Key version that produced the blob.
    pub version: u32,
}

/// Splits a symmetric blob into its header and sealed body.
pub fn parse_blob(blob: &[u8]) -> Result<(BlobHeader, &[u8]), KmsError> {
    let malformed = || KmsError::InvalidCiphertext("ciphertext blob is malformed".into());

    let (&format, rest) = blob.split_first().ok_or_else(malformed)?;
    if format != BLOB_FORMAT {
        return Err(malformed());
    }
    let (&id_len, rest) = rest.split_first().ok_or_else(malformed)?;
    let id_len = usize::from(id_len);
    if id_len == 0 || rest.len() < id_len + 4 + aead::OVERHEAD {
        return Err(malformed());
    }
    let (id, rest) = rest.split_at(id_len);
    let (version, sealed) = rest.split_at(4);

    let key_id = std::str::from_utf8(id).map_err(|_| malformed())?.to_string();
    let version = u32::from_be_bytes([version[0], version[1], version[2], version[3]]);

    Ok((BlobHeader { key_id, version }, sealed))
}

fn blob_aad(
    key_id: &str,
    version: u32,
    context: Option<&EncryptionContext>,
) -> Result<Vec<u8>, KmsError> {
    let empty = EncryptionContext::new();
    let context = serde_json::to_vec(context.unwrap_or(&empty))?;

    let mut aad = Vec::with_capacity(BLOB_AAD_LABEL.len() + key_id.len() + 6 + context.len());
    aad.extend_from_slice(BLOB_AAD_LABEL);
    aad.push(0);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&version.to_be_bytes());
    aad.extend_from_slice(&context);
    Ok(aad)
}

/// Validates the shape of an encryption context.
pub fn validate_context(context: Option<&EncryptionContext>) -> Result<(), KmsError> {
    let Some(context) = context else {
        return Ok(());
    };
    if context.keys().any(String::is_empty) {
        return Err(KmsError::Validation("encryption context keys may not be empty".into()));
    }
    let size: usize = context.iter().map(|(k, v)| k.len() + v.len()).sum();
    if size > 8192 {
        return Err(KmsError::Validation("encryption context exceeds 8192 bytes".into()));
    }
    Ok(())
}

fn usage_error(key: &Key, what: &str) -> KmsError {
    KmsError::InvalidKeyUsage(format!(
        "key {} ({}, {}) cannot {what}",
        key.key_id, key.key_spec, key.key_usage
    ))
}

fn map_input(err: CryptoError) -> KmsError {
    match err {
        CryptoError::InputTooLarge { len, max } => {
            KmsError::Validation(format!("input of {len} bytes exceeds the {max} byte limit"))
        },
        CryptoError::InvalidInput(msg) => KmsError::Validation(msg),
        other => KmsError::Crypto(other),
    }
}

// ============================================================================
// Material generation
// ============================================================================

/// Generates fresh material for `spec`.
///
/// Symmetric and HMAC material is random bytes, RSA material a PKCS#8 DER
/// private key and EC material the raw private scalar.
pub fn generate_material(spec: KeySpec) -> Result<KeyMaterial, KmsError> {
    if let Some(bits) = spec.rsa_bits() {
        let der = asymmetric::generate_rsa(bits)?;
        return Ok(KeyMaterial::from_slice(&der));
    }
    if let Some(curve) = spec.curve() {
        return Ok(KeyMaterial::from_slice(&asymmetric::generate_ec(curve)));
    }
    if let Some(hash) = spec.mac_hash() {
        return Ok(KeyMaterial::from_slice(&random::generate_secret(hash.output_len())));
    }
    Ok(KeyMaterial::from_slice(&*random::generate_key()))
}

/// DER SubjectPublicKeyInfo of an asymmetric key.
pub fn public_key(key: &Key, material: &KeyMaterial) -> Result<Vec<u8>, KmsError> {
    if let Some(curve) = key.key_spec.curve() {
        return Ok(asymmetric::ec_public_key_der(curve, material.as_bytes())?);
    }
    if key.key_spec.rsa_bits().is_some() {
        return Ok(asymmetric::rsa_public_key_der(material.as_bytes())?);
    }
    Err(KmsError::UnsupportedOperation(format!(
        "{} keys have no public key",
        key.key_spec
    )))
}

/// Random bytes for GenerateRandom.
pub fn generate_random(len: usize) -> Result<Vec<u8>, KmsError> {
    if !RANDOM_BYTES_RANGE.contains(&len) {
        return Err(KmsError::Validation(format!(
            "NumberOfBytes must be between 1 and 1024, got {len}"
        )));
    }
    Ok(random::generate_bytes(len))
}

// ============================================================================
// Encryption
// ============================================================================

fn check_encryption_key(key: &Key, algorithm: EncryptionAlgorithm) -> Result<(), KmsError> {
    if key.key_usage != KeyUsage::EncryptDecrypt {
        return Err(usage_error(key, "encrypt or decrypt"));
    }
    if !key.key_spec.encryption_algorithms().contains(&algorithm) {
        return Err(KmsError::InvalidKeyUsage(format!(
            "{algorithm} is not valid for {} keys",
            key.key_spec
        )));
    }
    Ok(())
}

fn rsa_modulus_len(key: &Key) -> usize {
    key.key_spec.rsa_bits().unwrap_or(0) / 8
}

/// Encrypts under the key's current `version`.
pub fn encrypt(
    key: &Key,
    version: u32,
    material: &KeyMaterial,
    algorithm: EncryptionAlgorithm,
    plaintext: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<Vec<u8>, KmsError> {
    check_encryption_key(key, algorithm)?;
    if plaintext.is_empty() {
        return Err(KmsError::Validation("plaintext may not be empty".into()));
    }

    let Some(hash) = algorithm.oaep_hash() else {
        return encrypt_symmetric(&key.key_id, version, material, plaintext, context);
    };
    if context.is_some_and(|c| !c.is_empty()) {
        return Err(KmsError::Validation(
            "encryption context is not supported with RSA keys".into(),
        ));
    }
    let max = asymmetric::rsa_oaep_max_plaintext(rsa_modulus_len(key), hash);
    if plaintext.len() > max {
        return Err(KmsError::Validation(format!(
            "plaintext of {} bytes exceeds {max} bytes for {algorithm} on {}",
            plaintext.len(),
            key.key_spec
        )));
    }
    asymmetric::rsa_oaep_encrypt(material.as_bytes(), hash, plaintext).map_err(map_input)
}

fn encrypt_symmetric(
    key_id: &str,
    version: u32,
    material: &KeyMaterial,
    plaintext: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<Vec<u8>, KmsError> {
    if plaintext.len() > MAX_SYMMETRIC_PLAINTEXT {
        return Err(KmsError::Validation(format!(
            "plaintext of {} bytes exceeds {MAX_SYMMETRIC_PLAINTEXT} bytes",
            plaintext.len()
        )));
    }
    validate_context(context)?;
    let id_len = u8::try_from(key_id.len())
        .map_err(|_| KmsError::Internal(format!("key id too long: {key_id}")))?;

    let sealed = aead::seal(
        material.as_bytes(),
        plaintext,
        &blob_aad(key_id, version, context)?,
    )?;

    let mut blob = Vec::with_capacity(2 + key_id.len() + 4 + sealed.len());
    blob.push(BLOB_FORMAT);
    blob.push(id_len);
    blob.extend_from_slice(key_id.as_bytes());
    blob.extend_from_slice(&version.to_be_bytes());
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Decrypts a symmetric blob whose header was parsed with [`parse_blob`].
pub fn decrypt_symmetric(
    header: &BlobHeader,
    sealed: &[u8],
    material: &KeyMaterial,
    context: Option<&EncryptionContext>,
) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    let aad = blob_aad(&header.key_id, header.version, context)?;
    aead::open(material.as_bytes(), sealed, &aad).map_err(|_| {
        KmsError::InvalidCiphertext(
            "ciphertext could not be authenticated with the given encryption context".into(),
        )
    })
}

/// Decrypts raw RSA-OAEP ciphertext.
pub fn decrypt_asymmetric(
    key: &Key,
    material: &KeyMaterial,
    algorithm: EncryptionAlgorithm,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    check_encryption_key(key, algorithm)?;
    let hash = algorithm.oaep_hash().ok_or_else(|| {
        KmsError::InvalidKeyUsage("symmetric algorithm requested for an RSA key".into())
    })?;
    asymmetric::rsa_oaep_decrypt(material.as_bytes(), hash, ciphertext)
        .map_err(|_| KmsError::InvalidCiphertext("RSA-OAEP decryption failed".into()))
}

/// Checks that a key may wrap data keys.
pub fn check_data_key_target(key: &Key) -> Result<(), KmsError> {
    if !key.key_spec.is_symmetric() || key.key_usage != KeyUsage::EncryptDecrypt {
        return Err(usage_error(key, "generate data keys"));
    }
    if key.custom_key_store_id.is_some() {
        return Err(usage_error(key, "generate data keys from a custom key store"));
    }
    Ok(())
}

/// Generates a random data key of `len` bytes.
pub fn generate_data_key(len: usize) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    if !RANDOM_BYTES_RANGE.contains(&len) {
        return Err(KmsError::Validation(format!(
            "NumberOfBytes must be between 1 and 1024, got {len}"
        )));
    }
    Ok(random::generate_secret(len))
}

/// A data key pair: PKCS#8 private key and SubjectPublicKeyInfo public key.
pub struct DataKeyPair {
    /// Private half, PKCS#8 DER.
    pub private_key: Zeroizing<Vec<u8>>,
    /// Public half, DER.
    pub public_key: Vec<u8>,
}

/// Generates a key pair for GenerateDataKeyPair.
pub fn generate_data_key_pair(spec: KeySpec) -> Result<DataKeyPair, KmsError> {
    if let Some(bits) = spec.rsa_bits() {
        let private_key = asymmetric::generate_rsa(bits)?;
        let public_key = asymmetric::rsa_public_key_der(&private_key)?;
        return Ok(DataKeyPair {
            private_key,
            public_key,
        });
    }
    if let Some(curve) = spec.curve() {
        let secret = asymmetric::generate_ec(curve);
        return Ok(DataKeyPair {
            private_key: asymmetric::ec_private_key_pkcs8(curve, &secret)?,
            public_key: asymmetric::ec_public_key_der(curve, &secret)?,
        });
    }
    Err(KmsError::Validation(format!(
        "{spec} is not a data key pair spec"
    )))
}

// ============================================================================
// Signatures
// ============================================================================

fn signing_digest(
    algorithm: SigningAlgorithm,
    message: &[u8],
    message_type: MessageType,
) -> Result<Vec<u8>, KmsError> {
    let hash = algorithm.hash();
    match message_type {
        MessageType::Raw => {
            if message.is_empty() || message.len() > MAX_MESSAGE_LEN {
                return Err(KmsError::Validation(format!(
                    "message must be 1-{MAX_MESSAGE_LEN} bytes"
                )));
            }
            Ok(hash.digest(message))
        },
        MessageType::Digest => {
            if message.len() != hash.output_len() {
                return Err(KmsError::Validation(format!(
                    "{algorithm} expects a {}-byte digest, got {}",
                    hash.output_len(),
                    message.len()
                )));
            }
            Ok(message.to_vec())
        },
    }
}

fn check_signing_key(key: &Key, algorithm: SigningAlgorithm) -> Result<(), KmsError> {
    if key.key_usage != KeyUsage::SignVerify {
        return Err(usage_error(key, "sign or verify"));
    }
    if !key.key_spec.signing_algorithms().contains(&algorithm) {
        return Err(KmsError::InvalidKeyUsage(format!(
            "{algorithm} is not valid for {} keys",
            key.key_spec
        )));
    }
    Ok(())
}

fn curve_of(key: &Key) -> Result<EccCurve, KmsError> {
    key.key_spec
        .curve()
        .ok_or_else(|| KmsError::Internal(format!("{} is not an EC spec", key.key_spec)))
}

/// Signs a message or digest.
pub fn sign(
    key: &Key,
    material: &KeyMaterial,
    algorithm: SigningAlgorithm,
    message: &[u8],
    message_type: MessageType,
) -> Result<Vec<u8>, KmsError> {
    check_signing_key(key, algorithm)?;
    let digest = signing_digest(algorithm, message, message_type)?;
    let signature = match algorithm.scheme() {
        SignatureScheme::Rsa(padding) => {
            asymmetric::rsa_sign(material.as_bytes(), padding, algorithm.hash(), &digest)?
        },
        SignatureScheme::Ecdsa => {
            asymmetric::ecdsa_sign(curve_of(key)?, material.as_bytes(), &digest)?
        },
    };
    Ok(signature)
}

/// Verifies a signature.
pub fn verify(
    key: &Key,
    material: &KeyMaterial,
    algorithm: SigningAlgorithm,
    message: &[u8],
    message_type: MessageType,
    signature: &[u8],
) -> Result<bool, KmsError> {
    check_signing_key(key, algorithm)?;
    let digest = signing_digest(algorithm, message, message_type)?;
    let valid = match algorithm.scheme() {
        SignatureScheme::Rsa(padding) => asymmetric::rsa_verify(
            material.as_bytes(),
            padding,
            algorithm.hash(),
            &digest,
            signature,
        )?,
        SignatureScheme::Ecdsa => {
            asymmetric::ecdsa_verify(curve_of(key)?, material.as_bytes(), &digest, signature)?
        },
    };
    Ok(valid)
}

// ============================================================================
// MACs and key agreement
// ============================================================================

fn check_mac_key(key: &Key, algorithm: MacAlgorithm, message: &[u8]) -> Result<(), KmsError> {
    if key.key_usage != KeyUsage::GenerateVerifyMac {
        return Err(usage_error(key, "generate or verify MACs"));
    }
    if key.key_spec.mac_algorithm() != Some(algorithm) {
        return Err(KmsError::InvalidKeyUsage(format!(
            "{algorithm} is not valid for {} keys",
            key.key_spec
        )));
    }
    if message.is_empty() || message.len() > MAX_MESSAGE_LEN {
        return Err(KmsError::Validation(format!(
            "message must be 1-{MAX_MESSAGE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Computes an HMAC.
pub fn generate_mac(
    key: &Key,
    material: &KeyMaterial,
    algorithm: MacAlgorithm,
    message: &[u8],
) -> Result<Vec<u8>, KmsError> {
    check_mac_key(key, algorithm, message)?;
    Ok(mac::compute(algorithm.hash(), material.as_bytes(), message)?)
}

/// Verifies an HMAC in constant time.
pub fn verify_mac(
    key: &Key,
    material: &KeyMaterial,
    algorithm: MacAlgorithm,
    message: &[u8],
    tag: &[u8],
) -> Result<bool, KmsError> {
    check_mac_key(key, algorithm, message)?;
    Ok(mac::verify(algorithm.hash(), material.as_bytes(), message, tag)?)
}

/// Derives an ECDH shared secret with a peer's DER public key.
pub fn derive_shared_secret(
    key: &Key,
    material: &KeyMaterial,
    peer_public_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    if key.key_usage != KeyUsage::KeyAgreement {
        return Err(usage_error(key, "derive shared secrets"));
    }
    asymmetric::ecdh(curve_of(key)?, material.as_bytes(), peer_public_key).map_err(map_input)
}

/// Largest RSA-OAEP plaintext for a key spec and algorithm.
pub fn oaep_limit(spec: KeySpec, algorithm: EncryptionAlgorithm) -> Option<usize> {
    let hash: HashAlgorithm = algorithm.oaep_hash()?;
    Some(asymmetric::rsa_oaep_max_plaintext(spec.rsa_bits()? / 8, hash))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::model::{KeyState, Origin, RotationSettings};

    fn key(spec: KeySpec, usage: KeyUsage) -> Key {
        Key {
            key_id: "1234abcd-12ab-34cd-56ef-1234567890ab".into(),
            region: "us-east-1".into(),
            account_id: "111122223333".into(),
            description: String::new(),
            key_spec: spec,
            key_usage: usage,
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
        }
    }

    fn ctx(pairs: &[(&str, &str)]) -> EncryptionContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_symmetric_roundtrip_and_context_binding() {
        let k = key(KeySpec::SymmetricDefault, KeyUsage::EncryptDecrypt);
        let material = generate_material(k.key_spec).unwrap();
        let app = ctx(&[("app", "x")]);

        let alg = EncryptionAlgorithm::SymmetricDefault;
        let blob = encrypt(&k, 3, &material, alg, b"hello", Some(&app)).unwrap();
        let (header, sealed) = parse_blob(&blob).unwrap();
        assert_eq!(header.key_id, k.key_id);
        assert_eq!(header.version, 3);

        let plaintext = decrypt_symmetric(&header, sealed, &material, Some(&app)).unwrap();
        assert_eq!(plaintext.as_slice(), b"hello");

        let wrong_contexts = [
            None,
            Some(ctx(&[])),
            Some(ctx(&[("app", "X")])),
            Some(ctx(&[("app", "x"), ("b", "c")])),
        ];
        for wrong in wrong_contexts {
            assert!(matches!(
                decrypt_symmetric(&header, sealed, &material, wrong.as_ref()),
                Err(KmsError::InvalidCiphertext(_))
            ));
        }

        // A missing context and an empty one are the same.
        let blob = encrypt(&k, 1, &material, alg, b"x", None).unwrap();
        let (header, sealed) = parse_blob(&blob).unwrap();
        decrypt_symmetric(&header, sealed, &material, Some(&ctx(&[]))).unwrap();
    }

    #[test]
    fn test_blob_header_is_authenticated() {
        let k = key(KeySpec::SymmetricDefault, KeyUsage::EncryptDecrypt);
        let material = generate_material(k.key_spec).unwrap();
        let mut blob =
            encrypt(&k, 1, &material, EncryptionAlgorithm::SymmetricDefault, b"data", None).unwrap();

        let version_at = 2 + k.key_id.len() + 3;
        blob[version_at] = 2;
        let (header, sealed) = parse_blob(&blob).unwrap();
        assert_eq!(header.version, 2);
        assert!(decrypt_symmetric(&header, sealed, &material, None).is_err());

        assert!(parse_blob(&[]).is_err());
        assert!(parse_blob(&[0x02, 1, b'k']).is_err());
        assert!(parse_blob(&blob[..10]).is_err());
    }

    #[test]
    fn test_symmetric_limits() {
        let k = key(KeySpec::SymmetricDefault, KeyUsage::EncryptDecrypt);
        let material = generate_material(k.key_spec).unwrap();
        encrypt(&k, 1, &material, EncryptionAlgorithm::SymmetricDefault, &[0u8; 4096], None).unwrap();
        assert!(matches!(
            encrypt(&k, 1, &material, EncryptionAlgorithm::SymmetricDefault, &[0u8; 4097], None),
            Err(KmsError::Validation(_))
        ));
        assert!(matches!(
            encrypt(&k, 1, &material, EncryptionAlgorithm::RsaesOaepSha256, b"x", None),
            Err(KmsError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_rsa_encryption() {
        let k = key(KeySpec::Rsa2048, KeyUsage::EncryptDecrypt);
        let material = generate_material(k.key_spec).unwrap();

        assert_eq!(oaep_limit(KeySpec::Rsa2048, EncryptionAlgorithm::RsaesOaepSha1), Some(214));
        let ct = encrypt(&k, 1, &material, EncryptionAlgorithm::RsaesOaepSha1, &[7u8; 214], None)
            .unwrap();
        assert_eq!(ct.len(), 256);
        let pt = decrypt_asymmetric(&k, &material, EncryptionAlgorithm::RsaesOaepSha1, &ct).unwrap();
        assert_eq!(pt.as_slice(), &[7u8; 214]);

        assert!(matches!(
            encrypt(&k, 1, &material, EncryptionAlgorithm::RsaesOaepSha1, &[7u8; 215], None),
            Err(KmsError::Validation(_))
        ));
        assert!(matches!(
            decrypt_asymmetric(&k, &material, EncryptionAlgorithm::RsaesOaepSha256, &ct),
            Err(KmsError::InvalidCiphertext(_))
        ));
        assert!(matches!(
            encrypt(&k, 1, &material, EncryptionAlgorithm::SymmetricDefault, b"x", None),
            Err(KmsError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_sign_verify_raw_and_digest() {
        let k = key(KeySpec::EccNistP256, KeyUsage::SignVerify);
        let material = generate_material(k.key_spec).unwrap();
        let alg = SigningAlgorithm::EcdsaSha256;

        let sig = sign(&k, &material, alg, b"message", MessageType::Raw).unwrap();
        assert!(verify(&k, &material, alg, b"message", MessageType::Raw, &sig).unwrap());
        assert!(!verify(&k, &material, alg, b"tampered", MessageType::Raw, &sig).unwrap());

        let digest = HashAlgorithm::Sha256.digest(b"message");
        assert!(verify(&k, &material, alg, &digest, MessageType::Digest, &sig).unwrap());
        assert!(matches!(
            sign(&k, &material, alg, &digest[..20], MessageType::Digest),
            Err(KmsError::Validation(_))
        ));
        assert!(matches!(
            sign(&k, &material, SigningAlgorithm::EcdsaSha384, b"m", MessageType::Raw),
            Err(KmsError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_rsa_signatures() {
        let k = key(KeySpec::Rsa2048, KeyUsage::SignVerify);
        let material = generate_material(k.key_spec).unwrap();
        for alg in [SigningAlgorithm::RsassaPssSha384, SigningAlgorithm::RsassaPkcs1V15Sha256] {
            let sig = sign(&k, &material, alg, b"payload", MessageType::Raw).unwrap();
            assert!(verify(&k, &material, alg, b"payload", MessageType::Raw, &sig).unwrap());
        }
    }

    #[test]
    fn test_mac() {
        let k = key(KeySpec::Hmac256, KeyUsage::GenerateVerifyMac);
        let material = generate_material(k.key_spec).unwrap();
        assert_eq!(material.len(), 32);

        let tag = generate_mac(&k, &material, MacAlgorithm::HmacSha256, b"msg").unwrap();
        assert!(verify_mac(&k, &material, MacAlgorithm::HmacSha256, b"msg", &tag).unwrap());
        assert!(!verify_mac(&k, &material, MacAlgorithm::HmacSha256, b"msg2", &tag).unwrap());
        assert!(matches!(
            generate_mac(&k, &material, MacAlgorithm::HmacSha512, b"msg"),
            Err(KmsError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_key_agreement() {
        let k = key(KeySpec::EccNistP384, KeyUsage::KeyAgreement);
        let material = generate_material(k.key_spec).unwrap();
        let peer = generate_data_key_pair(KeySpec::EccNistP384).unwrap();

        let secret = derive_shared_secret(&k, &material, &peer.public_key).unwrap();
        assert_eq!(secret.len(), 48);
        assert!(matches!(
            derive_shared_secret(&k, &material, b"not a key"),
            Err(KmsError::Validation(_))
        ));

        let signer = key(KeySpec::EccNistP384, KeyUsage::SignVerify);
        assert!(matches!(
            derive_shared_secret(&signer, &material, &peer.public_key),
            Err(KmsError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_data_keys() {
        assert_eq!(generate_data_key(32).unwrap().len(), 32);
        assert!(generate_data_key(0).is_err());
        assert!(generate_data_key(1025).is_err());
        assert!(generate_random(1024).is_ok());

        let rsa_key = key(KeySpec::Rsa2048, KeyUsage::EncryptDecrypt);
        assert!(matches!(
            check_data_key_target(&rsa_key),
            Err(KmsError::InvalidKeyUsage(_))
        ));
        let mut custom = key(KeySpec::SymmetricDefault, KeyUsage::EncryptDecrypt);
        custom.custom_key_store_id = Some("cks-1".into());
        assert!(check_data_key_target(&custom).is_err());

        let pair = generate_data_key_pair(KeySpec::EccSecgP256k1).unwrap();
        assert!(!pair.private_key.is_empty());
        assert!(generate_data_key_pair(KeySpec::Hmac256).is_err());
    }

    #[test]
    fn test_public_key() {
        let k = key(KeySpec::EccNistP256, KeyUsage::SignVerify);
        let material = generate_material(k.key_spec).unwrap();
        assert!(!public_key(&k, &material).unwrap().is_empty());

        let sym = key(KeySpec::SymmetricDefault, KeyUsage::EncryptDecrypt);
        assert!(matches!(
            public_key(&sym, &generate_material(sym.key_spec).unwrap()),
            Err(KmsError::UnsupportedOperation(_))
        ));
    }
}
