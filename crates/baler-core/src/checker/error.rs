use std::fmt;

use baler_types::{BlobHandle, BlobId, BlobKind, IndexId, PackId, SnapshotId};
use thiserror::Error;

/// How a finding affects the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Suboptimal layout; nothing is wrong.
    Hint,
    /// Wasted space that prune can reclaim.
    Reclaimable,
    /// Metadata references something that is missing or malformed.
    Structural,
    /// Stored bytes do not match their hash.
    Integrity,
    /// A transient failure that went away on the second read.
    Recovered,
    /// The phase could not run to completion.
    Fatal,
}

/// A problem found inside one tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeIssue {
    #[error("file {node:?} has no content list")]
    NilContent { node: String },

    #[error("node {node:?}: blob {handle} not found in index")]
    MissingBlob { node: String, handle: BlobHandle },

    #[error("node {node:?}: {expected} blob {id} is only stored as {found}")]
    WrongBlobKind {
        node: String,
        id: BlobId,
        expected: BlobKind,
        found: BlobKind,
    },

    #[error("dir node {node:?} has no subtree")]
    MissingSubtree { node: String },

    #[error("dir node {node:?} has null subtree")]
    NullSubtree { node: String },

    #[error("file node {node:?} has a subtree")]
    FileWithSubtree { node: String },

    #[error("dir node {node:?} has content")]
    DirWithContent { node: String },

    #[error("failed to load tree: {reason}")]
    LoadFailed { reason: String },
}

/// One finding reported by a checker phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("pack {pack} contains both data and tree blobs")]
    MixedPack { pack: PackId },

    #[error("pack {pack} is listed in {} index files: {}", indexes.len(), IdList(indexes))]
    DuplicatePacks { pack: PackId, indexes: Vec<IndexId> },

    #[error("index {index}: {reason}")]
    IndexCorrupt { index: IndexId, reason: String },

    #[error("listing index files failed: {reason}")]
    IndexList { reason: String },

    #[error("pack {pack} referenced in index but not found")]
    MissingPack { pack: PackId },

    #[error("pack {pack} not referenced in any index ({size} bytes)")]
    OrphanedPack { pack: PackId, size: u64 },

    #[error("pack {pack}: size {actual} does not match {expected} implied by index")]
    PackSizeMismatch {
        pack: PackId,
        expected: u64,
        actual: u64,
    },

    #[error("listing packs failed: {reason}")]
    PackList { reason: String },

    #[error("snapshot {snapshot}: {reason}")]
    SnapshotLoad { snapshot: SnapshotId, reason: String },

    #[error("snapshot {snapshot} has no tree")]
    SnapshotNoTree { snapshot: SnapshotId },

    #[error("tree {tree}: {}", IssueList(issues))]
    Tree { tree: BlobId, issues: Vec<TreeIssue> },

    #[error("pack {pack}: cannot read: {reason}")]
    PackRead { pack: PackId, reason: String },

    #[error("pack {pack}: content hashes to {actual}")]
    PackHashMismatch { pack: PackId, actual: PackId },

    #[error("pack {pack}: header: {reason}")]
    PackHeader { pack: PackId, reason: String },

    #[error("pack {pack}: blob {handle}: {reason}")]
    Blob {
        pack: PackId,
        handle: BlobHandle,
        reason: String,
    },

    #[error("pack {pack}: check successful on second attempt, original error: {original}")]
    RecoveredOnRetry { pack: PackId, original: String },

    #[error("check cancelled")]
    Cancelled,
}

impl CheckError {
    pub fn severity(&self) -> Severity {
        match self {
            CheckError::MixedPack { .. } | CheckError::DuplicatePacks { .. } => Severity::Hint,
            CheckError::OrphanedPack { .. } => Severity::Reclaimable,
            CheckError::MissingPack { .. }
            | CheckError::PackSizeMismatch { .. }
            | CheckError::SnapshotLoad { .. }
            | CheckError::SnapshotNoTree { .. }
            | CheckError::Tree { .. } => Severity::Structural,
            CheckError::PackHashMismatch { .. }
            | CheckError::PackHeader { .. }
            | CheckError::Blob { .. }
            | CheckError::PackRead { .. } => Severity::Integrity,
            CheckError::RecoveredOnRetry { .. } => Severity::Recovered,
            CheckError::IndexCorrupt { .. }
            | CheckError::IndexList { .. }
            | CheckError::PackList { .. }
            | CheckError::Cancelled => Severity::Fatal,
        }
    }

    /// Whether the finding should block operations that rely on a sound
    /// repository, such as prune.
    pub fn is_error(&self) -> bool {
        matches!(
            self.severity(),
            Severity::Structural | Severity::Integrity | Severity::Fatal
        )
    }
}

struct IdList<'a>(&'a [IndexId]);

impl fmt::Display for IdList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

struct IssueList<'a>(&'a [TreeIssue]);

impl fmt::Display for IssueList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_message_names_original_error() {
        let e = CheckError::RecoveredOnRetry {
            pack: PackId::compute(b"p"),
            original: "blob mismatch".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("check successful on second attempt, original error: blob mismatch"));
        assert!(!e.is_error());
    }

    #[test]
    fn severities_drive_is_error() {
        let pack = PackId::compute(b"p");
        assert!(!CheckError::MixedPack { pack }.is_error());
        assert!(!CheckError::OrphanedPack { pack, size: 1 }.is_error());
        assert!(CheckError::MissingPack { pack }.is_error());
        assert!(CheckError::PackHashMismatch { pack, actual: pack }.is_error());
        assert!(CheckError::Cancelled.is_error());
    }

    #[test]
    fn tree_error_lists_issues() {
        let e = CheckError::Tree {
            tree: BlobId::compute(b"t"),
            issues: vec![
                TreeIssue::NilContent { node: "a".into() },
                TreeIssue::MissingSubtree { node: "b".into() },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("\"a\" has no content list"));
        assert!(msg.contains("; dir node \"b\" has no subtree"));
    }
}
