//! # Keyward Crypto
//!
//! Core cryptographic primitives for the Keyward key management service.
//!
//! This crate provides the low-level operations the KMS engine composes:
//! - Symmetric authenticated encryption (AES-256-GCM)
//! - Asymmetric encryption (RSA-OAEP)
//! - Digital signatures (RSASSA-PSS, RSASSA-PKCS1-v1_5, ECDSA)
//! - Key agreement (ECDH)
//! - Message authentication (HMAC-SHA2)
//! - Key derivation (HKDF)
//! - Secure random generation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod asymmetric;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod mac;
pub mod random;

pub use error::CryptoError;
pub use keys::{KeyMaterial, MasterKey};
