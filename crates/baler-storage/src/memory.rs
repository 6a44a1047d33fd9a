use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use baler_types::error::{BalerError, Result};

use crate::{verify_content_hash, Backend, FileType, Handle, HashAlgorithm, ObjectInfo};

/// In-memory backend. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<Handle, Vec<u8>>>,
    hasher: Option<HashAlgorithm>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that advertises BLAKE2b-256 and verifies it on save.
    pub fn with_hasher() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            hasher: Some(HashAlgorithm::Blake2b256),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Handle, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored objects of a type.
    pub fn count(&self, file_type: FileType) -> usize {
        self.map().keys().filter(|h| h.file_type == file_type).count()
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory:".to_string()
    }

    fn list(&self, file_type: FileType) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .map()
            .iter()
            .filter(|(h, _)| h.file_type == file_type)
            .map(|(h, data)| ObjectInfo {
                name: h.name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let map = self.map();
        let data = map
            .get(handle)
            .ok_or_else(|| BalerError::NotFound(handle.to_string()))?;
        let start = offset as usize;
        if start > data.len() {
            return Err(BalerError::Storage(format!(
                "short read on {handle}: offset {offset} beyond size {}",
                data.len()
            )));
        }
        if length == 0 {
            return Ok(data[start..].to_vec());
        }
        let end = start.checked_add(length as usize).ok_or_else(|| {
            BalerError::Storage(format!(
                "short read on {handle} at offset {offset}: offset + length overflows usize"
            ))
        })?;
        if end > data.len() {
            return Err(BalerError::Storage(format!(
                "short read on {handle} at offset {offset}: expected {length} bytes, got {}",
                data.len() - start
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn save(&self, handle: &Handle, data: &[u8], content_hash: Option<&[u8; 32]>) -> Result<()> {
        if let Some(algorithm) = self.hasher {
            verify_content_hash(algorithm, handle, data, content_hash)?;
        }
        let mut map = self.map();
        if map.contains_key(handle) {
            return Err(BalerError::AlreadyExists(handle.to_string()));
        }
        map.insert(handle.clone(), data.to_vec());
        Ok(())
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.map().remove(handle);
        Ok(())
    }

    fn hasher(&self) -> Option<HashAlgorithm> {
        self.hasher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Pack, "0011");
        be.save(&h, b"hello world", None).unwrap();
        assert_eq!(be.load(&h, 6, 5).unwrap(), b"world");
        assert_eq!(be.load_all(&h).unwrap(), b"hello world");
        assert_eq!(be.count(FileType::Pack), 1);
        be.remove(&h).unwrap();
        assert!(be.load_all(&h).is_err());
    }

    #[test]
    fn save_does_not_overwrite() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Index, "aa");
        be.save(&h, b"one", None).unwrap();
        assert!(matches!(
            be.save(&h, b"two", None),
            Err(BalerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn out_of_range_load_fails() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Pack, "bb");
        be.save(&h, b"abc", None).unwrap();
        assert!(be.load(&h, 2, 5).is_err());
        assert!(be.load(&h, 9, 0).is_err());
    }

    #[test]
    fn hashing_backend_rejects_bad_hash() {
        let be = MemoryBackend::with_hasher();
        let h = Handle::new(FileType::Index, "cc");
        let wrong = [0u8; 32];
        assert!(be.save(&h, b"payload", Some(&wrong)).is_err());
        let right = HashAlgorithm::Blake2b256.digest(b"payload");
        be.save(&h, b"payload", Some(&right)).unwrap();
        assert_eq!(be.hasher(), Some(HashAlgorithm::Blake2b256));
    }
}
