//! # Keyward KMS
//!
//! Key lifecycle and authorization engine.
//!
//! ## Features
//!
//! - Symmetric, RSA, ECC and HMAC keys with versioned material
//! - Envelope encryption with encryption-context binding
//! - Grants with tokens and eventually consistent id lookup
//! - Key policies and per-principal identity policies
//! - Aliases, tags, imported material and multi-Region keys
//! - Scheduled deletion and rotation driven by [`Kms::run_maintenance`]
//!
//! ## Example
//!
//! ```ignore
//! let kms = Kms::new(config, backend, master_key, Arc::new(SystemClock))?;
//! let caller = kms.root_caller();
//! let key = kms.create_key(&caller, CreateKeyRequest::default()).await?;
//! let sealed = kms.encrypt(&caller, EncryptRequest { key_id: key.key_metadata.key_id, .. }).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod grants;
pub mod import;
pub mod lifecycle;
pub mod model;
pub mod page;
pub mod policy;
pub mod requests;
pub mod service;
pub mod store;

pub use api::dispatch;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KmsConfig;
pub use error::{ErrorKind, KmsError};
pub use service::{Caller, Kms, MaintenanceReport};
