//! # Keyward Storage
//!
//! Storage abstraction layer for Keyward backends.
//!
//! Backends expose a flat, versioned key-value namespace and commit
//! multi-key [`WriteBatch`]es atomically, with per-entry compare-and-swap
//! preconditions. The KMS engine builds its typed repository on top of this
//! contract and never depends on a concrete engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod batch;
pub mod error;
pub mod memory;

pub use backend::{StorageBackend, Versioned};
pub use batch::{Precondition, WriteBatch, WriteOp};
pub use error::StorageError;
pub use memory::MemoryBackend;
