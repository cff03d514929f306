//! Key derivation (HKDF-SHA256, RFC 5869).
//!
//! The KMS never uses its master key directly: every purpose (wrapping key
//! material, sealing import tokens, signing grant tokens, fingerprinting
//! imported material) gets its own subkey derived from a domain label.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;
use crate::error::CryptoError;

/// Derives `length` bytes from `ikm` using HKDF-SHA256.
pub fn derive_key(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if length == 0 {
        return Err(CryptoError::InvalidInput(
            "output length must be > 0".to_string(),
        ));
    }

    if length > 255 * 32 {
        return Err(CryptoError::InvalidInput(
            "output length too large for HKDF-SHA256".to_string(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyGenerationFailed("HKDF expansion failed".to_string()))?;

    Ok(okm)
}

/// Derives a 256-bit subkey of `master_key` for the given domain label.
///
/// Labels are joined with `:` so `derive_subkey(k, &["wrap", id, "3"])` and
/// `derive_subkey(k, &["wrap", id, "4"])` never collide.
pub fn derive_subkey(
    master_key: &[u8],
    label: &[&str],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let info = label.join(":");
    let derived = derive_key(master_key, None, info.as_bytes(), KEY_SIZE)?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&derived);

    Ok(key)
}
