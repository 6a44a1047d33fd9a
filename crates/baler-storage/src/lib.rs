pub mod local;
pub mod memory;

use std::fmt;

use baler_types::error::{BalerError, Result};

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// Kinds of objects stored in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Config,
    Key,
    Snapshot,
    Index,
    Pack,
}

impl FileType {
    /// Directory (or, for `Config`, file) name under the repository root.
    pub fn dir(self) -> &'static str {
        match self {
            FileType::Config => "config",
            FileType::Key => "keys",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Pack => "packs",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// Names one object: its type plus a name (hex id for everything but `Config`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }

    /// `/`-separated storage key. Packs are sharded by the first byte of their name.
    pub fn storage_key(&self) -> String {
        match self.file_type {
            FileType::Config => "config".to_string(),
            FileType::Pack if self.name.len() >= 2 => {
                format!("packs/{}/{}", &self.name[..2], self.name)
            }
            other => format!("{}/{}", other.dir(), self.name),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_type == FileType::Config {
            return f.write_str("<config>");
        }
        let short = self.name.get(..16).unwrap_or(&self.name);
        write!(f, "<{}/{}>", self.file_type, short)
    }
}

/// One entry of a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

/// Content hash a backend can verify on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake2b256,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> [u8; 32] {
        match self {
            HashAlgorithm::Blake2b256 => baler_types::id::hash_bytes(data),
        }
    }
}

/// Capability set the repository core needs from a storage location.
///
/// Implementations must be safe to call from many threads at once, and
/// `load` must be free of side effects so a failed read can simply be retried.
pub trait Backend: Send + Sync {
    /// Human-readable location for log messages.
    fn location(&self) -> String;

    /// Enumerate all objects of a type. No ordering is guaranteed.
    fn list(&self, file_type: FileType) -> Result<Vec<ObjectInfo>>;

    /// Read `length` bytes starting at `offset`. `length == 0` reads to the end.
    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Create a new object. Fails with `AlreadyExists` instead of overwriting.
    ///
    /// `content_hash` is supplied by callers when [`Backend::hasher`] advertises an
    /// algorithm; such backends reject data that does not match it.
    fn save(&self, handle: &Handle, data: &[u8], content_hash: Option<&[u8; 32]>) -> Result<()>;

    /// Delete an object. Removing an absent object is not an error.
    fn remove(&self, handle: &Handle) -> Result<()>;

    /// Hash algorithm this backend verifies during `save`, if any.
    fn hasher(&self) -> Option<HashAlgorithm> {
        None
    }

    fn load_all(&self, handle: &Handle) -> Result<Vec<u8>> {
        self.load(handle, 0, 0)
    }
}

/// Check `data` against a caller-supplied hash for backends with a hasher.
pub(crate) fn verify_content_hash(
    algorithm: HashAlgorithm,
    handle: &Handle,
    data: &[u8],
    content_hash: Option<&[u8; 32]>,
) -> Result<()> {
    let Some(expected) = content_hash else {
        return Ok(());
    };
    let actual = algorithm.digest(data);
    if &actual != expected {
        return Err(BalerError::HashMismatch {
            what: handle.to_string(),
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_keys_are_sharded() {
        let h = Handle::new(FileType::Pack, "abcdef0123");
        assert_eq!(h.storage_key(), "packs/ab/abcdef0123");
    }

    #[test]
    fn other_keys_live_in_type_dir() {
        assert_eq!(
            Handle::new(FileType::Index, "0011").storage_key(),
            "index/0011"
        );
        assert_eq!(
            Handle::new(FileType::Snapshot, "ff").storage_key(),
            "snapshots/ff"
        );
        assert_eq!(Handle::config().storage_key(), "config");
    }

    #[test]
    fn verify_content_hash_rejects_mismatch() {
        let h = Handle::new(FileType::Index, "00");
        let good = HashAlgorithm::Blake2b256.digest(b"payload");
        assert!(verify_content_hash(HashAlgorithm::Blake2b256, &h, b"payload", Some(&good)).is_ok());
        assert!(verify_content_hash(HashAlgorithm::Blake2b256, &h, b"other", Some(&good)).is_err());
        assert!(verify_content_hash(HashAlgorithm::Blake2b256, &h, b"other", None).is_ok());
    }
}
