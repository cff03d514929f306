//! Atomic multi-key write batches.

/// Condition a single write places on the current state of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No requirement.
    None,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
}

impl Precondition {
    /// Evaluates the precondition against the current version of a key.
    pub fn holds(&self, current: Option<u64>) -> bool {
        match self {
            Self::None => true,
            Self::Absent => current.is_none(),
            Self::Version(expected) => current == Some(*expected),
        }
    }
}

/// One entry of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create or overwrite a value.
    Put {
        /// Target key.
        key: String,
        /// New value.
        value: Vec<u8>,
        /// Required state before the write.
        precondition: Precondition,
    },
    /// Remove a value.
    Delete {
        /// Target key.
        key: String,
        /// Required state before the delete.
        precondition: Precondition,
    },
    /// Assert a precondition without writing.
    ///
    /// Used to make a commit depend on rows that were only read.
    Check {
        /// Checked key.
        key: String,
        /// Required state.
        precondition: Precondition,
    },
}

impl WriteOp {
    /// Key this entry touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } | Self::Check { key, .. } => key,
        }
    }

    /// Precondition attached to this entry.
    pub fn precondition(&self) -> Precondition {
        match self {
            Self::Put { precondition, .. }
            | Self::Delete { precondition, .. }
            | Self::Check { precondition, .. } => *precondition,
        }
    }
}

/// An ordered list of writes committed all-or-nothing.
///
/// When several entries target the same key, the last write wins; every
/// precondition is still checked against the pre-batch state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.put_if(key, value, Precondition::None)
    }

    /// Conditional put.
    pub fn put_if(
        &mut self,
        key: impl Into<String>,
        value: Vec<u8>,
        precondition: Precondition,
    ) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
            precondition,
        });
        self
    }

    /// Unconditional delete.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.delete_if(key, Precondition::None)
    }

    /// Conditional delete.
    pub fn delete_if(&mut self, key: impl Into<String>, precondition: Precondition) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            key: key.into(),
            precondition,
        });
        self
    }

    /// Read-only assertion.
    pub fn check(&mut self, key: impl Into<String>, precondition: Precondition) -> &mut Self {
        self.ops.push(WriteOp::Check {
            key: key.into(),
            precondition,
        });
        self
    }

    /// Whether the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Entries in insertion order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch into its entries.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
