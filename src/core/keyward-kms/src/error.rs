//! KMS engine error types.

use thiserror::Error;

use keyward_crypto::CryptoError;
use keyward_storage::StorageError;

/// Failure categories surfaced to callers.
///
/// Every [`KmsError`] maps onto exactly one kind; transports translate kinds
/// into wire error codes with [`ErrorKind::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown key, grant or alias.
    NotFound,
    /// The resource name is already taken.
    AlreadyExists,
    /// The key's lifecycle state forbids the operation.
    InvalidState,
    /// The key is disabled.
    Disabled,
    /// The key has no usable material.
    KeyUnavailable,
    /// Key spec, usage or algorithm do not fit together.
    InvalidParameterCombination,
    /// A parameter is malformed or out of range.
    Validation,
    /// The key cannot perform the requested operation.
    InvalidKeyUsage,
    /// The operation is not supported for this kind of key.
    UnsupportedOperation,
    /// Corrupt, tampered or mismatched ciphertext.
    InvalidCiphertext,
    /// The supplied key is not the one that produced the ciphertext.
    IncorrectKey,
    /// Imported material differs from the material previously imported.
    IncorrectKeyMaterial,
    /// The import token has expired.
    ExpiredImportToken,
    /// The import token is malformed or belongs to another key.
    InvalidImportToken,
    /// The grant token is malformed or forged.
    InvalidGrantToken,
    /// The pagination marker is not one this service issued.
    InvalidMarker,
    /// Authorization denied the request.
    AccessDenied,
    /// A configured quota would be exceeded.
    LimitExceeded,
    /// A concurrent writer won the race.
    Conflict,
    /// Backend failure.
    Internal,
    /// The storage backend did not answer in time.
    DependencyTimeout,
}

impl ErrorKind {
    /// Whether a caller may repeat the identical request.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Internal | Self::DependencyTimeout)
    }

    /// Wire-level exception name.
    pub fn code(self) -> &'static str {
        match self {
            Self::NotFound => "NotFoundException",
            Self::AlreadyExists => "AlreadyExistsException",
            Self::InvalidState => "KMSInvalidStateException",
            Self::Disabled => "DisabledException",
            Self::KeyUnavailable => "KeyUnavailableException",
            Self::InvalidParameterCombination => "InvalidParameterCombinationException",
            Self::Validation => "ValidationException",
            Self::InvalidKeyUsage => "InvalidKeyUsageException",
            Self::UnsupportedOperation => "UnsupportedOperationException",
            Self::InvalidCiphertext => "InvalidCiphertextException",
            Self::IncorrectKey => "IncorrectKeyException",
            Self::IncorrectKeyMaterial => "IncorrectKeyMaterialException",
            Self::ExpiredImportToken => "ExpiredImportTokenException",
            Self::InvalidImportToken => "InvalidImportTokenException",
            Self::InvalidGrantToken => "InvalidGrantTokenException",
            Self::InvalidMarker => "InvalidMarkerException",
            Self::AccessDenied => "AccessDeniedException",
            Self::LimitExceeded => "LimitExceededException",
            Self::Conflict => "ConflictException",
            Self::Internal => "KMSInternalException",
            Self::DependencyTimeout => "DependencyTimeoutException",
        }
    }
}

/// Errors that can occur in the KMS engine.
#[derive(Debug, Error)]
pub enum KmsError {
    /// Unknown key, grant or alias.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation incompatible with the key state.
    #[error("invalid key state: {0}")]
    InvalidState(String),

    /// Key is disabled.
    #[error("key is disabled: {0}")]
    Disabled(String),

    /// Key material is not available.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Spec, usage or algorithm mismatch.
    #[error("invalid parameter combination: {0}")]
    InvalidParameterCombination(String),

    /// Malformed or out-of-range parameter.
    #[error("validation error: {0}")]
    Validation(String),

    /// The key's usage does not permit the operation.
    #[error("invalid key usage: {0}")]
    InvalidKeyUsage(String),

    /// Operation not supported for this key.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Ciphertext could not be authenticated.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Ciphertext was produced by a different key.
    #[error("incorrect key: {0}")]
    IncorrectKey(String),

    /// Imported material does not match earlier imports.
    #[error("incorrect key material: {0}")]
    IncorrectKeyMaterial(String),

    /// Import token expired.
    #[error("import token expired")]
    ExpiredImportToken,

    /// Import token malformed or bound to another key.
    #[error("invalid import token: {0}")]
    InvalidImportToken(String),

    /// Grant token malformed or forged.
    #[error("invalid grant token: {0}")]
    InvalidGrantToken(String),

    /// Pagination marker not recognised.
    #[error("invalid marker")]
    InvalidMarker,

    /// Authorization denied.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Quota exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Lost a concurrent update race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage timeout.
    #[error("dependency timeout: {0}")]
    DependencyTimeout(String),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl KmsError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            Self::InvalidParameterCombination(_) => ErrorKind::InvalidParameterCombination,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidKeyUsage(_) => ErrorKind::InvalidKeyUsage,
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::InvalidCiphertext(_) => ErrorKind::InvalidCiphertext,
            Self::IncorrectKey(_) => ErrorKind::IncorrectKey,
            Self::IncorrectKeyMaterial(_) => ErrorKind::IncorrectKeyMaterial,
            Self::ExpiredImportToken => ErrorKind::ExpiredImportToken,
            Self::InvalidImportToken(_) => ErrorKind::InvalidImportToken,
            Self::InvalidGrantToken(_) => ErrorKind::InvalidGrantToken,
            Self::InvalidMarker => ErrorKind::InvalidMarker,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) | Self::Crypto(_) => ErrorKind::Internal,
            Self::DependencyTimeout(_) => ErrorKind::DependencyTimeout,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<StorageError> for KmsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(key) => {
                Self::Conflict(format!("concurrent modification of {key}, retry the request"))
            },
            StorageError::Timeout(detail) => Self::DependencyTimeout(detail),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("record encoding: {err}"))
    }
}
