use thiserror::Error;

use crate::blob::BlobHandle;
use crate::id::PackId;

pub type Result<T> = std::result::Result<T, BalerError>;

#[derive(Debug, Error)]
pub enum BalerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("repository already exists: {0}")]
    RepoAlreadyExists(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("blob {0} not found in index")]
    BlobNotInIndex(BlobHandle),

    #[error("hash mismatch for {what}: expected {expected}, got {actual}")]
    HashMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("index is already finalized")]
    IndexFinalized,

    #[error("index is not finalized")]
    IndexNotFinalized,

    #[error("index has no id")]
    IndexWithoutId,

    #[error("{} needed packs are missing from the backend", .0.len())]
    PacksMissing(Vec<PackId>),

    #[error("{0} used blobs are not in the index")]
    BlobsMissing(usize),

    #[error("pack {pack}: index implies {expected} bytes but backend has {actual}, repair the index")]
    PackSizeMismatch {
        pack: PackId,
        expected: u64,
        actual: u64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
