//! Asymmetric primitives: RSA-OAEP, RSA and ECDSA signatures, ECDH.
//!
//! Private material is exchanged with the caller as bytes: PKCS#8 DER for RSA
//! keys and the raw big-endian scalar for EC keys. Public keys are always
//! returned as DER-encoded SubjectPublicKeyInfo.
//!
//! Signing and verification operate on message digests; hashing a raw message
//! first is the caller's job (see [`HashAlgorithm::digest`]).

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Hash functions used by the asymmetric schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (RSA-OAEP only).
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hashes `message`.
    pub fn digest(self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(message).to_vec(),
            Self::Sha256 => Sha256::digest(message).to_vec(),
            Self::Sha384 => Sha384::digest(message).to_vec(),
            Self::Sha512 => Sha512::digest(message).to_vec(),
        }
    }
}

/// RSA signature padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaPadding {
    /// RSASSA-PSS with salt length equal to the digest length.
    Pss,
    /// RSASSA-PKCS1-v1_5.
    Pkcs1v15,
}

// ============================================================================
// RSA
// ============================================================================

fn load_rsa(private_der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_der(private_der)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed RSA private key: {e}")))
}

fn oaep(hash: HashAlgorithm) -> Oaep {
    match hash {
        HashAlgorithm::Sha1 => Oaep::new::<Sha1>(),
        HashAlgorithm::Sha256 => Oaep::new::<Sha256>(),
        HashAlgorithm::Sha384 => Oaep::new::<Sha384>(),
        HashAlgorithm::Sha512 => Oaep::new::<Sha512>(),
    }
}

/// Generates an RSA private key of `bits` bits, encoded as PKCS#8 DER.
pub fn generate_rsa(bits: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

/// Returns the SubjectPublicKeyInfo DER of an RSA private key.
pub fn rsa_public_key_der(private_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    load_rsa(private_der)?
        .to_public_key()
        .to_public_key_der()
        .map(|doc| doc.into_vec())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Largest plaintext RSA-OAEP accepts for a modulus of `modulus_len` bytes.
pub fn rsa_oaep_max_plaintext(modulus_len: usize, hash: HashAlgorithm) -> usize {
    modulus_len.saturating_sub(2 * hash.output_len() + 2)
}

/// Encrypts with RSA-OAEP using the public half of a private key.
pub fn rsa_oaep_encrypt(
    private_der: &[u8],
    hash: HashAlgorithm,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let public = load_rsa(private_der)?.to_public_key();
    encrypt_with(&public, hash, plaintext)
}

/// Encrypts with RSA-OAEP under a DER-encoded public key.
///
/// This is the operation a client performs when wrapping key material for
/// import.
pub fn rsa_oaep_encrypt_to(
    public_der: &[u8],
    hash: HashAlgorithm,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let public = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed RSA public key: {e}")))?;
    encrypt_with(&public, hash, plaintext)
}

fn encrypt_with(
    public: &RsaPublicKey,
    hash: HashAlgorithm,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let max = rsa_oaep_max_plaintext(public.size(), hash);
    if plaintext.len() > max {
        return Err(CryptoError::InputTooLarge {
            len: plaintext.len(),
            max,
        });
    }
    public
        .encrypt(&mut OsRng, oaep(hash), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypts an RSA-OAEP ciphertext.
pub fn rsa_oaep_decrypt(
    private_der: &[u8],
    hash: HashAlgorithm,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = load_rsa(private_der)?;
    key.decrypt(oaep(hash), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed("RSA-OAEP decryption failed".to_string()))
}

/// Signs a message digest with RSA.
pub fn rsa_sign(
    private_der: &[u8],
    padding: RsaPadding,
    hash: HashAlgorithm,
    digest: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = load_rsa(private_der)?;
    let result = match (padding, hash) {
        (RsaPadding::Pss, HashAlgorithm::Sha256) => {
            key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), digest)
        },
        (RsaPadding::Pss, HashAlgorithm::Sha384) => {
            key.sign_with_rng(&mut OsRng, Pss::new::<Sha384>(), digest)
        },
        (RsaPadding::Pss, HashAlgorithm::Sha512) => {
            key.sign_with_rng(&mut OsRng, Pss::new::<Sha512>(), digest)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha256) => {
            key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha384) => {
            key.sign(Pkcs1v15Sign::new::<Sha384>(), digest)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha512) => {
            key.sign(Pkcs1v15Sign::new::<Sha512>(), digest)
        },
        (_, HashAlgorithm::Sha1) => {
            return Err(CryptoError::InvalidInput(
                "SHA-1 is not accepted for signatures".to_string(),
            ))
        },
    };
    result.map_err(|e| CryptoError::SignatureFailed(e.to_string()))
}

/// Verifies an RSA signature over a message digest.
pub fn rsa_verify(
    private_der: &[u8],
    padding: RsaPadding,
    hash: HashAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let public = load_rsa(private_der)?.to_public_key();
    let result = match (padding, hash) {
        (RsaPadding::Pss, HashAlgorithm::Sha256) => {
            public.verify(Pss::new::<Sha256>(), digest, signature)
        },
        (RsaPadding::Pss, HashAlgorithm::Sha384) => {
            public.verify(Pss::new::<Sha384>(), digest, signature)
        },
        (RsaPadding::Pss, HashAlgorithm::Sha512) => {
            public.verify(Pss::new::<Sha512>(), digest, signature)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha256) => {
            public.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha384) => {
            public.verify(Pkcs1v15Sign::new::<Sha384>(), digest, signature)
        },
        (RsaPadding::Pkcs1v15, HashAlgorithm::Sha512) => {
            public.verify(Pkcs1v15Sign::new::<Sha512>(), digest, signature)
        },
        (_, HashAlgorithm::Sha1) => {
            return Err(CryptoError::InvalidInput(
                "SHA-1 is not accepted for signatures".to_string(),
            ))
        },
    };
    Ok(result.is_ok())
}

// ============================================================================
// Elliptic curves
// ============================================================================

/// Supported elliptic curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    /// NIST P-256 (secp256r1).
    P256,
    /// NIST P-384 (secp384r1).
    P384,
    /// SECG secp256k1.
    Secp256k1,
}

macro_rules! curve_ops {
    ($module:ident, $krate:ident) => {
        mod $module {
            use $krate::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
            use $krate::ecdsa::{Signature, SigningKey};
            use $krate::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey};
            use $krate::{PublicKey, SecretKey};
            use rand::rngs::OsRng;
            use zeroize::Zeroizing;

            use crate::error::CryptoError;

            fn secret(bytes: &[u8]) -> Result<SecretKey, CryptoError> {
                SecretKey::from_slice(bytes)
                    .map_err(|_| CryptoError::InvalidKey("malformed EC private key".to_string()))
            }

            pub fn generate() -> Zeroizing<Vec<u8>> {
                let secret = SecretKey::random(&mut OsRng);
                Zeroizing::new(secret.to_bytes().to_vec())
            }

            pub fn public_key_der(bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
                secret(bytes)?
                    .public_key()
                    .to_public_key_der()
                    .map(|doc| doc.into_vec())
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))
            }

            pub fn private_key_pkcs8(bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
                let document = secret(bytes)?
                    .to_pkcs8_der()
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Ok(Zeroizing::new(document.as_bytes().to_vec()))
            }

            pub fn sign_prehash(bytes: &[u8], digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
                let signing_key = SigningKey::from(secret(bytes)?);
                let signature: Signature = signing_key
                    .sign_prehash(digest)
                    .map_err(|e| CryptoError::SignatureFailed(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }

            pub fn verify_prehash(
                bytes: &[u8],
                digest: &[u8],
                signature: &[u8],
            ) -> Result<bool, CryptoError> {
                let signing_key = SigningKey::from(secret(bytes)?);
                let Ok(signature) = Signature::from_der(signature) else {
                    return Ok(false);
                };
                Ok(signing_key
                    .verifying_key()
                    .verify_prehash(digest, &signature)
                    .is_ok())
            }

            pub fn diffie_hellman(
                bytes: &[u8],
                peer_public_der: &[u8],
            ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
                let peer = PublicKey::from_public_key_der(peer_public_der).map_err(|e| {
                    CryptoError::InvalidInput(format!("malformed peer public key: {e}"))
                })?;
                let shared =
                    $krate::ecdh::diffie_hellman(secret(bytes)?.to_nonzero_scalar(), peer.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    };
}

curve_ops!(nist_p256, p256);
curve_ops!(nist_p384, p384);
curve_ops!(secg_k256, k256);

/// Generates a private scalar on `curve`.
pub fn generate_ec(curve: EccCurve) -> Zeroizing<Vec<u8>> {
    match curve {
        EccCurve::P256 => nist_p256::generate(),
        EccCurve::P384 => nist_p384::generate(),
        EccCurve::Secp256k1 => secg_k256::generate(),
    }
}

/// Returns the SubjectPublicKeyInfo DER for an EC private scalar.
pub fn ec_public_key_der(curve: EccCurve, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match curve {
        EccCurve::P256 => nist_p256::public_key_der(secret),
        EccCurve::P384 => nist_p384::public_key_der(secret),
        EccCurve::Secp256k1 => secg_k256::public_key_der(secret),
    }
}

/// Encodes an EC private scalar as PKCS#8 DER.
pub fn ec_private_key_pkcs8(
    curve: EccCurve,
    secret: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match curve {
        EccCurve::P256 => nist_p256::private_key_pkcs8(secret),
        EccCurve::P384 => nist_p384::private_key_pkcs8(secret),
        EccCurve::Secp256k1 => secg_k256::private_key_pkcs8(secret),
    }
}

/// Produces a DER-encoded ECDSA signature over a digest.
pub fn ecdsa_sign(curve: EccCurve, secret: &[u8], digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match curve {
        EccCurve::P256 => nist_p256::sign_prehash(secret, digest),
        EccCurve::P384 => nist_p384::sign_prehash(secret, digest),
        EccCurve::Secp256k1 => secg_k256::sign_prehash(secret, digest),
    }
}

/// Verifies a DER-encoded ECDSA signature over a digest.
pub fn ecdsa_verify(
    curve: EccCurve,
    secret: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    match curve {
        EccCurve::P256 => nist_p256::verify_prehash(secret, digest, signature),
        EccCurve::P384 => nist_p384::verify_prehash(secret, digest, signature),
        EccCurve::Secp256k1 => secg_k256::verify_prehash(secret, digest, signature),
    }
}

/// Computes the raw ECDH shared secret with a peer's public key.
pub fn ecdh(
    curve: EccCurve,
    secret: &[u8],
    peer_public_der: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match curve {
        EccCurve::P256 => nist_p256::diffie_hellman(secret, peer_public_der),
        EccCurve::P384 => nist_p384::diffie_hellman(secret, peer_public_der),
        EccCurve::Secp256k1 => secg_k256::diffie_hellman(secret, peer_public_der),
    }
}
