//! Persistent records and the vocabulary shared by every component.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use keyward_crypto::asymmetric::{EccCurve, HashAlgorithm, RsaPadding};
use keyward_crypto::mac::MacHash;

use crate::error::KmsError;

/// Caller-supplied additional authenticated data.
///
/// A `BTreeMap` so that its JSON encoding is canonical (sorted by key).
pub type EncryptionContext = BTreeMap<String, String>;

// ============================================================================
// Wire enums
// ============================================================================

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Name used on the wire and in policies.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $wire ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = KmsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok(Self::$variant), )+
                    _ => Err(KmsError::Validation(format!(
                        "invalid {}: {s}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum! {
    /// Cryptographic configuration of a key.
    KeySpec {
        /// AES-256-GCM.
        SymmetricDefault => "SYMMETRIC_DEFAULT",
        /// RSA with a 2048-bit modulus.
        Rsa2048 => "RSA_2048",
        /// RSA with a 3072-bit modulus.
        Rsa3072 => "RSA_3072",
        /// RSA with a 4096-bit modulus.
        Rsa4096 => "RSA_4096",
        /// NIST P-256.
        EccNistP256 => "ECC_NIST_P256",
        /// NIST P-384.
        EccNistP384 => "ECC_NIST_P384",
        /// SECG secp256k1.
        EccSecgP256k1 => "ECC_SECG_P256K1",
        /// 224-bit HMAC key.
        Hmac224 => "HMAC_224",
        /// 256-bit HMAC key.
        Hmac256 => "HMAC_256",
        /// 384-bit HMAC key.
        Hmac384 => "HMAC_384",
        /// 512-bit HMAC key.
        Hmac512 => "HMAC_512",
    }
}

wire_enum! {
    /// What a key may be used for. Fixed at creation.
    KeyUsage {
        /// Encrypt and decrypt.
        EncryptDecrypt => "ENCRYPT_DECRYPT",
        /// Sign and verify.
        SignVerify => "SIGN_VERIFY",
        /// Generate and verify MACs.
        GenerateVerifyMac => "GENERATE_VERIFY_MAC",
        /// Derive shared secrets.
        KeyAgreement => "KEY_AGREEMENT",
    }
}

wire_enum! {
    /// Where a key's material comes from.
    Origin {
        /// Generated by this service.
        ServiceGenerated => "SERVICE_GENERATED",
        /// Imported by the caller.
        External => "EXTERNAL",
        /// Held by a custom key store.
        CustomStore => "CUSTOM_STORE",
    }
}

wire_enum! {
    /// Lifecycle state of a key.
    KeyState {
        /// Usable.
        Enabled => "Enabled",
        /// Not usable for cryptographic operations.
        Disabled => "Disabled",
        /// Scheduled for deletion.
        PendingDeletion => "PendingDeletion",
        /// Waiting for external material.
        PendingImport => "PendingImport",
        /// Primary waiting for its replicas to be deleted.
        PendingReplicaDeletion => "PendingReplicaDeletion",
        /// Primary region transfer in progress.
        Updating => "Updating",
    }
}

wire_enum! {
    /// Whether imported material expires.
    ExpirationModel {
        /// Material is removed at `valid_to`.
        KeyMaterialExpires => "KEY_MATERIAL_EXPIRES",
        /// Material never expires.
        KeyMaterialDoesNotExpire => "KEY_MATERIAL_DOES_NOT_EXPIRE",
    }
}

wire_enum! {
    /// Role of a key in a multi-Region set.
    MultiRegionKeyType {
        /// Owns rotation and replication.
        Primary => "PRIMARY",
        /// Follows the primary.
        Replica => "REPLICA",
    }
}

wire_enum! {
    /// Encryption algorithms.
    EncryptionAlgorithm {
        /// AES-256-GCM with a self-describing blob.
        SymmetricDefault => "SYMMETRIC_DEFAULT",
        /// RSA-OAEP with SHA-1.
        RsaesOaepSha1 => "RSAES_OAEP_SHA_1",
        /// RSA-OAEP with SHA-256.
        RsaesOaepSha256 => "RSAES_OAEP_SHA_256",
    }
}

wire_enum! {
    /// Signing algorithms.
    SigningAlgorithm {
        /// RSASSA-PSS with SHA-256.
        RsassaPssSha256 => "RSASSA_PSS_SHA_256",
        /// RSASSA-PSS with SHA-384.
        RsassaPssSha384 => "RSASSA_PSS_SHA_384",
        /// RSASSA-PSS with SHA-512.
        RsassaPssSha512 => "RSASSA_PSS_SHA_512",
        /// RSASSA-PKCS1-v1_5 with SHA-256.
        RsassaPkcs1V15Sha256 => "RSASSA_PKCS1_V1_5_SHA_256",
        /// RSASSA-PKCS1-v1_5 with SHA-384.
        RsassaPkcs1V15Sha384 => "RSASSA_PKCS1_V1_5_SHA_384",
        /// RSASSA-PKCS1-v1_5 with SHA-512.
        RsassaPkcs1V15Sha512 => "RSASSA_PKCS1_V1_5_SHA_512",
        /// ECDSA with SHA-256.
        EcdsaSha256 => "ECDSA_SHA_256",
        /// ECDSA with SHA-384.
        EcdsaSha384 => "ECDSA_SHA_384",
    }
}

wire_enum! {
    /// MAC algorithms.
    MacAlgorithm {
        /// HMAC-SHA-224.
        HmacSha224 => "HMAC_SHA_224",
        /// HMAC-SHA-256.
        HmacSha256 => "HMAC_SHA_256",
        /// HMAC-SHA-384.
        HmacSha384 => "HMAC_SHA_384",
        /// HMAC-SHA-512.
        HmacSha512 => "HMAC_SHA_512",
    }
}

wire_enum! {
    /// Key agreement algorithms.
    KeyAgreementAlgorithm {
        /// Elliptic-curve Diffie-Hellman.
        Ecdh => "ECDH",
    }
}

wire_enum! {
    /// How the `Message` of Sign/Verify is interpreted.
    MessageType {
        /// The message is hashed by the service.
        Raw => "RAW",
        /// The message is already a digest.
        Digest => "DIGEST",
    }
}

wire_enum! {
    /// Length presets for GenerateDataKey.
    DataKeySpec {
        /// 32 bytes.
        Aes256 => "AES_256",
        /// 16 bytes.
        Aes128 => "AES_128",
    }
}

wire_enum! {
    /// Padding used to wrap material for import.
    WrappingAlgorithm {
        /// RSA-OAEP with SHA-1.
        RsaesOaepSha1 => "RSAES_OAEP_SHA_1",
        /// RSA-OAEP with SHA-256.
        RsaesOaepSha256 => "RSAES_OAEP_SHA_256",
    }
}

wire_enum! {
    /// Size of the import wrapping key.
    WrappingKeySpec {
        /// 2048-bit RSA.
        Rsa2048 => "RSA_2048",
        /// 3072-bit RSA.
        Rsa3072 => "RSA_3072",
        /// 4096-bit RSA.
        Rsa4096 => "RSA_4096",
    }
}

wire_enum! {
    /// How a key version came to exist.
    RotationType {
        /// Created with the key or imported.
        Initial => "INITIAL",
        /// Produced by the rotation schedule.
        Automatic => "AUTOMATIC",
        /// Produced by RotateKeyOnDemand.
        OnDemand => "ON_DEMAND",
    }
}

wire_enum! {
    /// Every authorizable action. Policy actions are `kms:` + the name.
    Operation {
        /// CreateKey.
        CreateKey => "CreateKey",
        /// DescribeKey.
        DescribeKey => "DescribeKey",
        /// EnableKey.
        EnableKey => "EnableKey",
        /// DisableKey.
        DisableKey => "DisableKey",
        /// ScheduleKeyDeletion.
        ScheduleKeyDeletion => "ScheduleKeyDeletion",
        /// CancelKeyDeletion.
        CancelKeyDeletion => "CancelKeyDeletion",
        /// EnableKeyRotation.
        EnableKeyRotation => "EnableKeyRotation",
        /// DisableKeyRotation.
        DisableKeyRotation => "DisableKeyRotation",
        /// GetKeyRotationStatus.
        GetKeyRotationStatus => "GetKeyRotationStatus",
        /// RotateKeyOnDemand.
        RotateKeyOnDemand => "RotateKeyOnDemand",
        /// ListKeyRotations.
        ListKeyRotations => "ListKeyRotations",
        /// GetParametersForImport.
        GetParametersForImport => "GetParametersForImport",
        /// ImportKeyMaterial.
        ImportKeyMaterial => "ImportKeyMaterial",
        /// DeleteImportedKeyMaterial.
        DeleteImportedKeyMaterial => "DeleteImportedKeyMaterial",
        /// Encrypt.
        Encrypt => "Encrypt",
        /// Decrypt.
        Decrypt => "Decrypt",
        /// Source side of ReEncrypt.
        ReEncryptFrom => "ReEncryptFrom",
        /// Destination side of ReEncrypt.
        ReEncryptTo => "ReEncryptTo",
        /// GenerateDataKey.
        GenerateDataKey => "GenerateDataKey",
        /// GenerateDataKeyWithoutPlaintext.
        GenerateDataKeyWithoutPlaintext => "GenerateDataKeyWithoutPlaintext",
        /// GenerateDataKeyPair.
        GenerateDataKeyPair => "GenerateDataKeyPair",
        /// GenerateDataKeyPairWithoutPlaintext.
        GenerateDataKeyPairWithoutPlaintext => "GenerateDataKeyPairWithoutPlaintext",
        /// GenerateRandom.
        GenerateRandom => "GenerateRandom",
        /// Sign.
        Sign => "Sign",
        /// Verify.
        Verify => "Verify",
        /// GenerateMac.
        GenerateMac => "GenerateMac",
        /// VerifyMac.
        VerifyMac => "VerifyMac",
        /// DeriveSharedSecret.
        DeriveSharedSecret => "DeriveSharedSecret",
        /// GetPublicKey.
        GetPublicKey => "GetPublicKey",
        /// CreateGrant.
        CreateGrant => "CreateGrant",
        /// ListGrants.
        ListGrants => "ListGrants",
        /// ListRetirableGrants.
        ListRetirableGrants => "ListRetirableGrants",
        /// RetireGrant.
        RetireGrant => "RetireGrant",
        /// RevokeGrant.
        RevokeGrant => "RevokeGrant",
        /// GetKeyPolicy.
        GetKeyPolicy => "GetKeyPolicy",
        /// PutKeyPolicy.
        PutKeyPolicy => "PutKeyPolicy",
        /// ListKeyPolicies.
        ListKeyPolicies => "ListKeyPolicies",
        /// CreateAlias.
        CreateAlias => "CreateAlias",
        /// DeleteAlias.
        DeleteAlias => "DeleteAlias",
        /// UpdateAlias.
        UpdateAlias => "UpdateAlias",
        /// ListAliases.
        ListAliases => "ListAliases",
        /// TagResource.
        TagResource => "TagResource",
        /// UntagResource.
        UntagResource => "UntagResource",
        /// ListResourceTags.
        ListResourceTags => "ListResourceTags",
        /// ListKeys.
        ListKeys => "ListKeys",
        /// UpdateKeyDescription.
        UpdateKeyDescription => "UpdateKeyDescription",
        /// ReplicateKey.
        ReplicateKey => "ReplicateKey",
        /// UpdatePrimaryRegion.
        UpdatePrimaryRegion => "UpdatePrimaryRegion",
    }
}

impl KeySpec {
    /// Whether this is the symmetric encryption spec.
    pub fn is_symmetric(self) -> bool {
        self == Self::SymmetricDefault
    }

    /// RSA modulus size in bits.
    pub fn rsa_bits(self) -> Option<usize> {
        match self {
            Self::Rsa2048 => Some(2048),
            Self::Rsa3072 => Some(3072),
            Self::Rsa4096 => Some(4096),
            _ => None,
        }
    }

    /// Elliptic curve, for ECC specs.
    pub fn curve(self) -> Option<EccCurve> {
        match self {
            Self::EccNistP256 => Some(EccCurve::P256),
            Self::EccNistP384 => Some(EccCurve::P384),
            Self::EccSecgP256k1 => Some(EccCurve::Secp256k1),
            _ => None,
        }
    }

    /// HMAC hash and key length, for HMAC specs.
    pub fn mac_hash(self) -> Option<MacHash> {
        match self {
            Self::Hmac224 => Some(MacHash::Sha224),
            Self::Hmac256 => Some(MacHash::Sha256),
            Self::Hmac384 => Some(MacHash::Sha384),
            Self::Hmac512 => Some(MacHash::Sha512),
            _ => None,
        }
    }

    /// Whether the spec has a public half.
    pub fn is_asymmetric(self) -> bool {
        self.rsa_bits().is_some() || self.curve().is_some()
    }

    /// Usages a key of this spec may be created with.
    pub fn supports_usage(self, usage: KeyUsage) -> bool {
        match usage {
            KeyUsage::EncryptDecrypt => self.is_symmetric() || self.rsa_bits().is_some(),
            KeyUsage::SignVerify => self.is_asymmetric(),
            KeyUsage::GenerateVerifyMac => self.mac_hash().is_some(),
            KeyUsage::KeyAgreement => matches!(self, Self::EccNistP256 | Self::EccNistP384),
        }
    }

    /// Encryption algorithms accepted by this spec.
    pub fn encryption_algorithms(self) -> Vec<EncryptionAlgorithm> {
        if self.is_symmetric() {
            vec![EncryptionAlgorithm::SymmetricDefault]
        } else if self.rsa_bits().is_some() {
            vec![EncryptionAlgorithm::RsaesOaepSha1, EncryptionAlgorithm::RsaesOaepSha256]
        } else {
            Vec::new()
        }
    }

    /// Signing algorithms accepted by this spec.
    pub fn signing_algorithms(self) -> Vec<SigningAlgorithm> {
        match self {
            Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096 => vec![
                SigningAlgorithm::RsassaPssSha256,
                SigningAlgorithm::RsassaPssSha384,
                SigningAlgorithm::RsassaPssSha512,
                SigningAlgorithm::RsassaPkcs1V15Sha256,
                SigningAlgorithm::RsassaPkcs1V15Sha384,
                SigningAlgorithm::RsassaPkcs1V15Sha512,
            ],
            Self::EccNistP256 | Self::EccSecgP256k1 => vec![SigningAlgorithm::EcdsaSha256],
            Self::EccNistP384 => vec![SigningAlgorithm::EcdsaSha384],
            _ => Vec::new(),
        }
    }

    /// MAC algorithm of an HMAC spec.
    pub fn mac_algorithm(self) -> Option<MacAlgorithm> {
        match self {
            Self::Hmac224 => Some(MacAlgorithm::HmacSha224),
            Self::Hmac256 => Some(MacAlgorithm::HmacSha256),
            Self::Hmac384 => Some(MacAlgorithm::HmacSha384),
            Self::Hmac512 => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

impl KeyUsage {
    /// Default usage for a spec when CreateKey omits one.
    pub fn default_for(spec: KeySpec) -> Self {
        if spec.mac_hash().is_some() {
            Self::GenerateVerifyMac
        } else if spec.curve().is_some() {
            Self::SignVerify
        } else {
            Self::EncryptDecrypt
        }
    }
}

impl EncryptionAlgorithm {
    /// OAEP hash for the RSA algorithms.
    pub fn oaep_hash(self) -> Option<HashAlgorithm> {
        match self {
            Self::SymmetricDefault => None,
            Self::RsaesOaepSha1 => Some(HashAlgorithm::Sha1),
            Self::RsaesOaepSha256 => Some(HashAlgorithm::Sha256),
        }
    }
}

/// Signature family of a [`SigningAlgorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// RSA with the given padding.
    Rsa(RsaPadding),
    /// ECDSA.
    Ecdsa,
}

impl SigningAlgorithm {
    /// Message digest used by the algorithm.
    pub fn hash(self) -> HashAlgorithm {
        match self {
            Self::RsassaPssSha256 | Self::RsassaPkcs1V15Sha256 | Self::EcdsaSha256 => {
                HashAlgorithm::Sha256
            },
            Self::RsassaPssSha384 | Self::RsassaPkcs1V15Sha384 | Self::EcdsaSha384 => {
                HashAlgorithm::Sha384
            },
            Self::RsassaPssSha512 | Self::RsassaPkcs1V15Sha512 => HashAlgorithm::Sha512,
        }
    }

    /// Signature family.
    pub fn scheme(self) -> SignatureScheme {
        match self {
            Self::RsassaPssSha256 | Self::RsassaPssSha384 | Self::RsassaPssSha512 => {
                SignatureScheme::Rsa(RsaPadding::Pss)
            },
            Self::RsassaPkcs1V15Sha256 | Self::RsassaPkcs1V15Sha384 | Self::RsassaPkcs1V15Sha512 => {
                SignatureScheme::Rsa(RsaPadding::Pkcs1v15)
            },
            Self::EcdsaSha256 | Self::EcdsaSha384 => SignatureScheme::Ecdsa,
        }
    }
}

impl MacAlgorithm {
    /// Underlying HMAC hash.
    pub fn hash(self) -> MacHash {
        match self {
            Self::HmacSha224 => MacHash::Sha224,
            Self::HmacSha256 => MacHash::Sha256,
            Self::HmacSha384 => MacHash::Sha384,
            Self::HmacSha512 => MacHash::Sha512,
        }
    }
}

impl DataKeySpec {
    /// Length in bytes.
    pub fn byte_len(self) -> usize {
        match self {
            Self::Aes256 => 32,
            Self::Aes128 => 16,
        }
    }
}

impl WrappingAlgorithm {
    /// OAEP hash.
    pub fn hash(self) -> HashAlgorithm {
        match self {
            Self::RsaesOaepSha1 => HashAlgorithm::Sha1,
            Self::RsaesOaepSha256 => HashAlgorithm::Sha256,
        }
    }
}

impl WrappingKeySpec {
    /// Modulus size in bits.
    pub fn bits(self) -> usize {
        match self {
            Self::Rsa2048 => 2048,
            Self::Rsa3072 => 3072,
            Self::Rsa4096 => 4096,
        }
    }
}

impl Operation {
    /// Policy action string, e.g. `kms:Encrypt`.
    pub fn action(self) -> String {
        format!("kms:{}", self.as_str())
    }

    /// Operations that need key material and are gated on key state.
    pub fn requires_material(self) -> bool {
        matches!(
            self,
            Self::Encrypt
                | Self::Decrypt
                | Self::ReEncryptFrom
                | Self::ReEncryptTo
                | Self::GenerateDataKey
                | Self::GenerateDataKeyWithoutPlaintext
                | Self::GenerateDataKeyPair
                | Self::GenerateDataKeyPairWithoutPlaintext
                | Self::Sign
                | Self::Verify
                | Self::GenerateMac
                | Self::VerifyMac
                | Self::DeriveSharedSecret
                | Self::GetPublicKey
        )
    }

    /// Operations a grant may delegate.
    pub fn is_grantable(self) -> bool {
        self.requires_material()
            || matches!(self, Self::CreateGrant | Self::RetireGrant | Self::DescribeKey)
    }

    /// Whether a key of `usage` can ever perform this operation.
    pub fn compatible_with(self, usage: KeyUsage) -> bool {
        match self {
            Self::CreateGrant | Self::RetireGrant | Self::DescribeKey => true,
            Self::Encrypt
            | Self::Decrypt
            | Self::ReEncryptFrom
            | Self::ReEncryptTo
            | Self::GenerateDataKey
            | Self::GenerateDataKeyWithoutPlaintext
            | Self::GenerateDataKeyPair
            | Self::GenerateDataKeyPairWithoutPlaintext => usage == KeyUsage::EncryptDecrypt,
            Self::Sign | Self::Verify => usage == KeyUsage::SignVerify,
            Self::GenerateMac | Self::VerifyMac => usage == KeyUsage::GenerateVerifyMac,
            Self::DeriveSharedSecret => usage == KeyUsage::KeyAgreement,
            Self::GetPublicKey => usage != KeyUsage::GenerateVerifyMac,
            _ => true,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Automatic rotation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Whether the schedule is active.
    pub enabled: bool,
    /// Days between automatic rotations.
    pub period_days: Option<u32>,
    /// When the next automatic rotation is due.
    pub next_rotation: Option<u64>,
    /// When the key last rotated (either kind).
    pub last_rotation: Option<u64>,
}

/// Multi-Region topology as seen by one member of the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRegionConfig {
    /// Role of this record.
    pub role: MultiRegionKeyType,
    /// Region holding the primary.
    pub primary_region: String,
    /// Regions holding replicas. Maintained on the primary only.
    pub replica_regions: Vec<String>,
}

/// A KMS key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Identifier, shared by every member of a multi-Region set.
    pub key_id: String,
    /// Region of this record.
    pub region: String,
    /// Owning account.
    pub account_id: String,
    /// Free-form description.
    pub description: String,
    /// Cryptographic configuration.
    pub key_spec: KeySpec,
    /// Permitted usage.
    pub key_usage: KeyUsage,
    /// Material origin.
    pub origin: Origin,
    /// Custom key store holding the material, for `CUSTOM_STORE` keys.
    pub custom_key_store_id: Option<String>,
    /// Lifecycle state.
    pub state: KeyState,
    /// Creation time.
    pub created_at: u64,
    /// When the key will be destroyed.
    pub deletion_date: Option<u64>,
    /// Waiting period requested by ScheduleKeyDeletion.
    pub pending_window_days: Option<u32>,
    /// Rotation schedule.
    pub rotation: RotationSettings,
    /// Expiration model of imported material.
    pub expiration_model: Option<ExpirationModel>,
    /// Expiry of imported material.
    pub valid_to: Option<u64>,
    /// Multi-Region membership, `None` for single-Region keys.
    pub multi_region: Option<MultiRegionConfig>,
    /// Version used for new encryptions; 0 when the key has no material.
    pub current_version: u32,
    /// Hex HMAC identifying the first material imported into the key.
    pub material_fingerprint: Option<String>,
    /// Target region of an unfinished primary-region transfer.
    pub pending_primary_region: Option<String>,
}

impl Key {
    /// Resource name of this record.
    pub fn arn(&self, partition: &str) -> String {
        key_arn(partition, &self.region, &self.account_id, &self.key_id)
    }

    /// Whether the record is a multi-Region primary.
    pub fn is_primary(&self) -> bool {
        matches!(&self.multi_region, Some(m) if m.role == MultiRegionKeyType::Primary)
    }

    /// Whether the record is a multi-Region replica.
    pub fn is_replica(&self) -> bool {
        matches!(&self.multi_region, Some(m) if m.role == MultiRegionKeyType::Replica)
    }

    /// Whether the key may be rotated at all.
    pub fn rotation_eligible(&self) -> bool {
        self.key_spec.is_symmetric()
            && self.origin == Origin::ServiceGenerated
            && self.custom_key_store_id.is_none()
    }

    /// Replica regions, for primaries.
    pub fn replica_regions(&self) -> &[String] {
        match &self.multi_region {
            Some(m) if m.role == MultiRegionKeyType::Primary => &m.replica_regions,
            _ => &[],
        }
    }
}

/// Immutable snapshot of a key's material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    /// Owning key.
    pub key_id: String,
    /// Version number, starting at 1.
    pub version: u32,
    /// Creation time.
    pub created_at: u64,
    /// How the version was produced.
    pub rotation_type: RotationType,
    /// Material sealed under the version's wrapping key.
    #[serde(with = "b64")]
    pub wrapped_material: Vec<u8>,
}

/// Constraints narrowing when a grant applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GrantConstraints {
    /// Request context must equal this map exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_context_equals: Option<EncryptionContext>,
    /// Request context must contain every pair of this map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_context_subset: Option<EncryptionContext>,
}

impl GrantConstraints {
    /// Whether `context` satisfies every constraint.
    pub fn satisfied_by(&self, context: Option<&EncryptionContext>) -> bool {
        let empty = EncryptionContext::new();
        let context = context.unwrap_or(&empty);

        if let Some(equals) = &self.encryption_context_equals {
            if equals != context {
                return false;
            }
        }
        if let Some(subset) = &self.encryption_context_subset {
            if !subset.iter().all(|(k, v)| context.get(k) == Some(v)) {
                return false;
            }
        }
        true
    }
}

/// A delegated permission on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Identifier.
    pub grant_id: String,
    /// Key the grant applies to.
    pub key_id: String,
    /// Optional client-chosen name, used for idempotent creation.
    pub name: Option<String>,
    /// Principal receiving the permissions.
    pub grantee_principal: String,
    /// Principal allowed to retire the grant.
    pub retiring_principal: Option<String>,
    /// Principal that created the grant.
    pub issuing_principal: String,
    /// Delegated operations.
    pub operations: Vec<Operation>,
    /// Encryption context constraints.
    pub constraints: Option<GrantConstraints>,
    /// Creation time.
    pub created_at: u64,
}

impl Grant {
    /// Whether the grant lets `principal` perform `operation` with `context`.
    pub fn permits(
        &self,
        principal: &str,
        operation: Operation,
        context: Option<&EncryptionContext>,
    ) -> bool {
        self.grantee_principal == principal
            && self.operations.contains(&operation)
            && self
                .constraints
                .as_ref()
                .map_or(true, |c| c.satisfied_by(context))
    }
}

/// Marker left behind by RevokeGrant/RetireGrant so outstanding grant tokens
/// stop working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantTombstone {
    /// Removed grant.
    pub grant_id: String,
    /// Removal time.
    pub removed_at: u64,
}

/// Friendly name pointing at a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// Name including the `alias/` prefix.
    pub name: String,
    /// Target key.
    pub target_key_id: String,
    /// Creation time.
    pub created_at: u64,
    /// Last retarget.
    pub updated_at: u64,
}

/// A resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Tag key.
    pub tag_key: String,
    /// Tag value.
    pub tag_value: String,
}

// ============================================================================
// Names and references
// ============================================================================

/// Prefix every alias name carries.
pub const ALIAS_PREFIX: &str = "alias/";

/// Resource name of a key.
pub fn key_arn(partition: &str, region: &str, account_id: &str, key_id: &str) -> String {
    format!("arn:{partition}:kms:{region}:{account_id}:key/{key_id}")
}

/// Resource name of an alias.
pub fn alias_arn(partition: &str, region: &str, account_id: &str, alias: &str) -> String {
    format!("arn:{partition}:kms:{region}:{account_id}:{alias}")
}

/// Generates an identifier for a new key.
pub fn new_key_id(multi_region: bool) -> String {
    let id = uuid::Uuid::new_v4();
    if multi_region {
        format!("mrk-{}", id.simple())
    } else {
        id.to_string()
    }
}

/// A caller-supplied way of naming a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// Bare key id or key ARN.
    Id {
        /// Key id.
        key_id: String,
        /// Region named by an ARN.
        region: Option<String>,
    },
    /// Alias name or alias ARN.
    Alias {
        /// Alias name with prefix.
        name: String,
        /// Region named by an ARN.
        region: Option<String>,
    },
}

impl KeyRef {
    /// Parses a key id, key ARN, alias name or alias ARN.
    pub fn parse(raw: &str) -> Result<Self, KmsError> {
        if raw.is_empty() || raw.len() > 2048 {
            return Err(KmsError::Validation("key reference must be 1-2048 chars".into()));
        }

        if let Some(rest) = raw.strip_prefix("arn:") {
            // partition:kms:region:account:resource
            let parts: Vec<&str> = rest.splitn(5, ':').collect();
            if parts.len() != 5 || parts[1] != "kms" {
                return Err(KmsError::NotFound(format!("malformed ARN: {raw}")));
            }
            let region = Some(parts[2].to_string());
            let resource = parts[4];
            return if let Some(key_id) = resource.strip_prefix("key/") {
                Ok(Self::Id {
                    key_id: key_id.to_string(),
                    region,
                })
            } else if resource.starts_with(ALIAS_PREFIX) {
                Ok(Self::Alias {
                    name: resource.to_string(),
                    region,
                })
            } else {
                Err(KmsError::NotFound(format!("malformed ARN: {raw}")))
            };
        }

        if raw.starts_with(ALIAS_PREFIX) {
            Ok(Self::Alias {
                name: raw.to_string(),
                region: None,
            })
        } else {
            Ok(Self::Id {
                key_id: raw.to_string(),
                region: None,
            })
        }
    }

    /// Region named by the reference, if it was an ARN.
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Id { region, .. } | Self::Alias { region, .. } => region.as_deref(),
        }
    }
}

/// Validates an alias name.
pub fn validate_alias_name(name: &str) -> Result<(), KmsError> {
    let Some(suffix) = name.strip_prefix(ALIAS_PREFIX) else {
        return Err(KmsError::Validation("alias name must start with alias/".into()));
    };
    if suffix.is_empty() || name.len() > 256 {
        return Err(KmsError::Validation("alias name must be 7-256 chars".into()));
    }
    if name.starts_with("alias/aws/") {
        return Err(KmsError::Validation("alias/aws/ is reserved".into()));
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'))
    {
        return Err(KmsError::Validation(
            "alias name may only contain [a-zA-Z0-9/_-]".into(),
        ));
    }
    Ok(())
}

/// Validates a tag.
pub fn validate_tag(tag: &Tag) -> Result<(), KmsError> {
    if tag.tag_key.is_empty() || tag.tag_key.chars().count() > 128 {
        return Err(KmsError::Validation("tag key must be 1-128 chars".into()));
    }
    if tag.tag_key.starts_with("aws:") {
        return Err(KmsError::Validation("tag keys may not start with aws:".into()));
    }
    if tag.tag_value.chars().count() > 256 {
        return Err(KmsError::Validation("tag value must be at most 256 chars".into()));
    }
    Ok(())
}

/// Account id embedded in an IAM principal ARN (`arn:p:iam::123456789012:...`).
pub fn principal_account(principal: &str) -> Option<&str> {
    let mut parts = principal.splitn(6, ':');
    let (Some("arn"), Some(_), Some("iam"), Some(""), Some(account), Some(resource)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if account.len() == 12 && account.chars().all(|c| c.is_ascii_digit()) && !resource.is_empty()
    {
        Some(account)
    } else {
        None
    }
}

/// Serde adapter encoding bytes as standard base64 strings.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes bytes as base64.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    /// Deserializes base64 into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }

    /// Same for optional fields.
    pub mod option {
        use super::*;

        /// Serializes optional bytes.
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserializes optional bytes.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_roundtrip() {
        for spec in KeySpec::ALL {
            assert_eq!(spec.as_str().parse::<KeySpec>().unwrap(), *spec);
        }
        assert_eq!(KeySpec::Rsa2048.as_str(), "RSA_2048");
        assert_eq!(
            serde_json::to_string(&KeyState::PendingDeletion).unwrap(),
            "\"PendingDeletion\""
        );
        assert!("RSA_1024".parse::<KeySpec>().is_err());
        assert!(serde_json::from_str::<KeyUsage>("\"SIGN\"").is_err());
    }

    #[test]
    fn test_spec_usage_compatibility() {
        assert!(KeySpec::SymmetricDefault.supports_usage(KeyUsage::EncryptDecrypt));
        assert!(!KeySpec::SymmetricDefault.supports_usage(KeyUsage::SignVerify));
        assert!(KeySpec::Rsa2048.supports_usage(KeyUsage::EncryptDecrypt));
        assert!(KeySpec::Rsa2048.supports_usage(KeyUsage::SignVerify));
        assert!(!KeySpec::Rsa2048.supports_usage(KeyUsage::KeyAgreement));
        assert!(KeySpec::EccNistP256.supports_usage(KeyUsage::KeyAgreement));
        assert!(!KeySpec::EccSecgP256k1.supports_usage(KeyUsage::KeyAgreement));
        assert!(!KeySpec::EccNistP384.supports_usage(KeyUsage::EncryptDecrypt));
        assert!(KeySpec::Hmac384.supports_usage(KeyUsage::GenerateVerifyMac));
        assert!(!KeySpec::Hmac384.supports_usage(KeyUsage::EncryptDecrypt));
    }

    #[test]
    fn test_key_ref_parse() {
        assert_eq!(
            KeyRef::parse("1234abcd-12ab-34cd-56ef-1234567890ab").unwrap(),
            KeyRef::Id {
                key_id: "1234abcd-12ab-34cd-56ef-1234567890ab".into(),
                region: None
            }
        );
        assert_eq!(
            KeyRef::parse("arn:keyward:kms:eu-west-1:111122223333:key/k1").unwrap(),
            KeyRef::Id {
                key_id: "k1".into(),
                region: Some("eu-west-1".into())
            }
        );
        assert_eq!(
            KeyRef::parse("alias/app").unwrap(),
            KeyRef::Alias {
                name: "alias/app".into(),
                region: None
            }
        );
        assert_eq!(
            KeyRef::parse("arn:keyward:kms:us-east-1:111122223333:alias/app/db").unwrap(),
            KeyRef::Alias {
                name: "alias/app/db".into(),
                region: Some("us-east-1".into())
            }
        );
        assert!(KeyRef::parse("").is_err());
        assert!(KeyRef::parse("arn:keyward:s3:::bucket").is_err());
    }

    #[test]
    fn test_alias_validation() {
        validate_alias_name("alias/app-prod_1/db").unwrap();
        assert!(validate_alias_name("app").is_err());
        assert!(validate_alias_name("alias/").is_err());
        assert!(validate_alias_name("alias/aws/ebs").is_err());
        assert!(validate_alias_name("alias/bad name").is_err());
    }

    #[test]
    fn test_principal_account() {
        assert_eq!(
            principal_account("arn:keyward:iam::111122223333:root"),
            Some("111122223333")
        );
        assert_eq!(
            principal_account("arn:keyward:iam::444455556666:role/app"),
            Some("444455556666")
        );
        assert_eq!(principal_account("arn:keyward:iam::1234:root"), None);
        assert_eq!(principal_account("alice"), None);
    }

    #[test]
    fn test_key_ids() {
        let single = new_key_id(false);
        assert_eq!(single.len(), 36);
        let multi = new_key_id(true);
        assert!(multi.starts_with("mrk-"));
        assert_eq!(multi.len(), 36);
        assert!(multi[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_grant_constraints() {
        let ctx: EncryptionContext = [("app".to_string(), "x".to_string())].into();
        let mut wider = ctx.clone();
        wider.insert("env".into(), "prod".into());

        let equals = GrantConstraints {
            encryption_context_equals: Some(ctx.clone()),
            encryption_context_subset: None,
        };
        assert!(equals.satisfied_by(Some(&ctx)));
        assert!(!equals.satisfied_by(Some(&wider)));
        assert!(!equals.satisfied_by(None));

        let subset = GrantConstraints {
            encryption_context_equals: None,
            encryption_context_subset: Some(ctx.clone()),
        };
        assert!(subset.satisfied_by(Some(&wider)));
        assert!(!subset.satisfied_by(Some(&EncryptionContext::new())));
    }

    #[test]
    fn test_operation_usage() {
        assert!(Operation::Encrypt.compatible_with(KeyUsage::EncryptDecrypt));
        assert!(!Operation::Sign.compatible_with(KeyUsage::EncryptDecrypt));
        assert!(Operation::DescribeKey.compatible_with(KeyUsage::GenerateVerifyMac));
        assert!(Operation::Decrypt.is_grantable());
        assert!(!Operation::ScheduleKeyDeletion.is_grantable());
        assert_eq!(Operation::ReEncryptFrom.action(), "kms:ReEncryptFrom");
    }
}
