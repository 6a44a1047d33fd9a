use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use baler_types::error::{BalerError, Result};
use tracing::debug;

use crate::{Backend, FileType, Handle, ObjectInfo};

/// Repository stored as plain files under one directory.
///
/// Objects are written through a temp file in the destination directory and
/// linked into place without replacing an existing object.
pub struct LocalBackend {
    root: PathBuf,
}

/// Prefix of in-flight temp files, never reported by `list`.
const TEMP_PREFIX: &str = ".tmp";

fn missing_is_empty<T: Default>(res: io::Result<T>) -> Result<T> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        other => Ok(other?),
    }
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            fs::create_dir_all(root)?;
        }
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage keys are relative, slash separated and stay below the root.
    fn validate_key(key: &str) -> Result<()> {
        let problem = if key.is_empty() {
            Some("empty")
        } else if key.contains('\\') {
            Some("contains a backslash")
        } else if Path::new(key).is_absolute() || key.starts_with('/') {
            Some("absolute")
        } else if Path::new(key)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            Some("leaves the repository")
        } else {
            None
        };
        match problem {
            Some(why) => Err(BalerError::InvalidFormat(format!(
                "storage key {key:?} rejected: {why}"
            ))),
            None => Ok(()),
        }
    }

    pub fn path_of(&self, handle: &Handle) -> Result<PathBuf> {
        let key = handle.storage_key();
        Self::validate_key(&key)?;
        Ok(self.root.join(key))
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(BalerError::AlreadyExists(path.display().to_string()))
            }
            Err(e) => Err(BalerError::Io(e.error)),
        }
    }

    /// Regular files below `top`, at any depth.
    fn walk(top: &Path) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut dirs = vec![top.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in missing_is_empty(fs::read_dir(&dir).map(|rd| rd.collect::<Vec<_>>()))? {
                let entry = entry?;
                let kind = entry.file_type()?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if kind.is_dir() {
                    dirs.push(entry.path());
                } else if kind.is_file() && !name.starts_with(TEMP_PREFIX) {
                    let size = entry.metadata()?.len();
                    out.push(ObjectInfo { name, size });
                }
            }
        }
        Ok(out)
    }
}

impl Backend for LocalBackend {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&self, file_type: FileType) -> Result<Vec<ObjectInfo>> {
        if file_type != FileType::Config {
            return Self::walk(&self.root.join(file_type.dir()));
        }
        let meta = missing_is_empty(fs::metadata(self.path_of(&Handle::config())?).map(Some))?;
        Ok(meta
            .map(|m| ObjectInfo {
                name: String::new(),
                size: m.len(),
            })
            .into_iter()
            .collect())
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = fs::File::open(self.path_of(handle)?).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BalerError::NotFound(handle.to_string()),
            _ => BalerError::Io(e),
        })?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        if length == 0 {
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }
        file.take(length).read_to_end(&mut buf)?;
        if (buf.len() as u64) < length {
            return Err(BalerError::Storage(format!(
                "{handle}: wanted {length} bytes at {offset}, file ended after {}",
                buf.len()
            )));
        }
        Ok(buf)
    }

    fn save(&self, handle: &Handle, data: &[u8], _content_hash: Option<&[u8; 32]>) -> Result<()> {
        debug!(handle = %handle, bytes = data.len(), "local: writing object");
        self.create_new(&self.path_of(handle)?, data)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        missing_is_empty(fs::remove_file(self.path_of(handle)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("\\Windows\\System32").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_key("foo\\bar").is_err());
        assert!(LocalBackend::validate_key("").is_err());
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (_dir, backend) = backend();
        let h = Handle::new(FileType::Index, "../escape");
        assert!(backend.save(&h, b"bad", None).is_err());
    }

    #[test]
    fn save_refuses_to_overwrite() {
        let (_dir, backend) = backend();
        let h = Handle::new(FileType::Index, "aa00");
        backend.save(&h, b"first", None).unwrap();
        let err = backend.save(&h, b"second", None).unwrap_err();
        assert!(matches!(err, BalerError::AlreadyExists(_)), "got {err:?}");
        assert_eq!(backend.load_all(&h).unwrap(), b"first");
    }

    #[test]
    fn load_range_and_to_end() {
        let (_dir, backend) = backend();
        let h = Handle::new(FileType::Pack, "abcdef");
        backend.save(&h, b"0123456789", None).unwrap();
        assert_eq!(backend.load(&h, 2, 3).unwrap(), b"234");
        assert_eq!(backend.load(&h, 7, 0).unwrap(), b"789");
        assert!(backend.load(&h, 8, 5).is_err());
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_dir, backend) = backend();
        let err = backend
            .load_all(&Handle::new(FileType::Snapshot, "00ff"))
            .unwrap_err();
        assert!(matches!(err, BalerError::NotFound(_)));
    }

    #[test]
    fn list_returns_names_and_sizes_per_type() {
        let (_dir, backend) = backend();
        backend
            .save(&Handle::new(FileType::Pack, "ab01"), b"pack-one", None)
            .unwrap();
        backend
            .save(&Handle::new(FileType::Pack, "cd02"), b"p2", None)
            .unwrap();
        backend
            .save(&Handle::new(FileType::Index, "ee03"), b"idx", None)
            .unwrap();

        let mut packs = backend.list(FileType::Pack).unwrap();
        packs.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            packs,
            vec![
                ObjectInfo {
                    name: "ab01".into(),
                    size: 8
                },
                ObjectInfo {
                    name: "cd02".into(),
                    size: 2
                },
            ]
        );
        assert_eq!(backend.list(FileType::Index).unwrap().len(), 1);
        assert!(backend.list(FileType::Snapshot).unwrap().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, backend) = backend();
        let h = Handle::new(FileType::Snapshot, "0102");
        backend.save(&h, b"snap", None).unwrap();
        backend.remove(&h).unwrap();
        backend.remove(&h).unwrap();
        assert!(backend.list(FileType::Snapshot).unwrap().is_empty());
    }

    #[test]
    fn config_lists_as_single_object() {
        let (_dir, backend) = backend();
        assert!(backend.list(FileType::Config).unwrap().is_empty());
        backend.save(&Handle::config(), b"cfg", None).unwrap();
        assert_eq!(backend.list(FileType::Config).unwrap().len(), 1);
    }
}
