//! HMAC-SHA2 message authentication.

use hmac::{Hmac, Mac};
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::error::CryptoError;

/// Hash function backing an HMAC computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacHash {
    /// HMAC-SHA-224.
    Sha224,
    /// HMAC-SHA-256.
    Sha256,
    /// HMAC-SHA-384.
    Sha384,
    /// HMAC-SHA-512.
    Sha512,
}

impl MacHash {
    /// Length of the produced tag in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

fn tag<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn check<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    message: &[u8],
    expected: &[u8],
) -> Result<bool, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    Ok(mac.verify_slice(expected).is_ok())
}

/// Computes an HMAC tag over `message`.
pub fn compute(hash: MacHash, key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match hash {
        MacHash::Sha224 => tag::<Hmac<Sha224>>(key, message),
        MacHash::Sha256 => tag::<Hmac<Sha256>>(key, message),
        MacHash::Sha384 => tag::<Hmac<Sha384>>(key, message),
        MacHash::Sha512 => tag::<Hmac<Sha512>>(key, message),
    }
}

/// Verifies an HMAC tag in constant time.
pub fn verify(
    hash: MacHash,
    key: &[u8],
    message: &[u8],
    expected: &[u8],
) -> Result<bool, CryptoError> {
    match hash {
        MacHash::Sha224 => check::<Hmac<Sha224>>(key, message, expected),
        MacHash::Sha256 => check::<Hmac<Sha256>>(key, message, expected),
        MacHash::Sha384 => check::<Hmac<Sha384>>(key, message, expected),
        MacHash::Sha512 => check::<Hmac<Sha512>>(key, message, expected),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case_2() {
        let tag = compute(MacHash::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_output_lengths() {
        for hash in [MacHash::Sha224, MacHash::Sha256, MacHash::Sha384, MacHash::Sha512] {
            let tag = compute(hash, &[1u8; 32], b"message").unwrap();
            assert_eq!(tag.len(), hash.output_len());
        }
    }

    #[test]
    fn test_verify() {
        let key = [9u8; 48];
        let tag = compute(MacHash::Sha384, &key, b"payload").unwrap();
        assert!(verify(MacHash::Sha384, &key, b"payload", &tag).unwrap());
        assert!(!verify(MacHash::Sha384, &key, b"payload!", &tag).unwrap());
        assert!(!verify(MacHash::Sha384, &[8u8; 48], b"payload", &tag).unwrap());
    }
}
