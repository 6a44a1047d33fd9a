use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::BlobId;

/// Distinguishes file content chunks from directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Data,
    Tree,
}

impl BlobKind {
    pub const ALL: [BlobKind; 2] = [BlobKind::Data, BlobKind::Tree];

    /// Position of this kind in per-kind arrays.
    pub fn slot(self) -> usize {
        match self {
            BlobKind::Data => 0,
            BlobKind::Tree => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlobKind::Data => "data",
            BlobKind::Tree => "tree",
        }
    }

    pub fn other(self) -> BlobKind {
        match self {
            BlobKind::Data => BlobKind::Tree,
            BlobKind::Tree => BlobKind::Data,
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blob id together with its kind. The same id stored as data and as tree
/// are two different blobs, so this is the lookup key everywhere.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobHandle {
    pub id: BlobId,
    pub kind: BlobKind,
}

impl BlobHandle {
    pub fn new(id: BlobId, kind: BlobKind) -> Self {
        Self { id, kind }
    }

    pub fn data(id: BlobId) -> Self {
        Self::new(id, BlobKind::Data)
    }

    pub fn tree(id: BlobId) -> Self {
        Self::new(id, BlobKind::Tree)
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.kind, self.id)
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.kind, self.id)
    }
}
