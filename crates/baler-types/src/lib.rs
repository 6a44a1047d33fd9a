pub mod blob;
pub mod error;
pub mod id;

pub use blob::{BlobHandle, BlobKind};
pub use error::{BalerError, Result};
pub use id::{BlobId, IndexId, PackId, SnapshotId};
