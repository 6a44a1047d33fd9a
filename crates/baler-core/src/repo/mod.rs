pub mod pack;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use baler_storage::{Backend, FileType, Handle};
use baler_types::{BalerError, BlobHandle, BlobId, BlobKind, PackId, Result, SnapshotId};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{BalerConfig, IndexConfig};
use crate::index::file::for_all_indexes;
use crate::index::{MasterIndex, PackedBlob};
use crate::snapshot::Snapshot;
use crate::tree::{Tree, TreeSource};

use self::pack::{pack_handle, read_blob, PackWriter, SealedPack};

pub const REPO_VERSION: u32 = 1;

/// Persisted (unencrypted) at the `config` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: Vec<u8>, // 32 bytes
    pub created: DateTime<Utc>,
    #[serde(default = "default_min_pack_size")]
    pub min_pack_size: u32,
    #[serde(default = "default_max_blobs_per_pack")]
    pub max_blobs_per_pack: usize,
}

fn default_min_pack_size() -> u32 {
    crate::config::RepositoryConfig::default().min_pack_size
}

fn default_max_blobs_per_pack() -> usize {
    crate::config::RepositoryConfig::default().max_blobs_per_pack
}

/// Content-addressed store of blobs in packs, plus snapshots and index files.
///
/// All methods take `&self`; a repository is shared as `Arc<Repository>`
/// between checker workers and prune.
pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepoConfig,
    index_config: IndexConfig,
    index: RwLock<Arc<MasterIndex>>,
    writers: Mutex<[PackWriter; 2]>,
}

impl Repository {
    /// Initialize a new repository.
    pub fn init(backend: Arc<dyn Backend>, config: &BalerConfig) -> Result<Self> {
        if !backend.list(FileType::Config)?.is_empty() {
            return Err(BalerError::RepoAlreadyExists(backend.location()));
        }
        let mut repo_id = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut repo_id);
        let repo_config = RepoConfig {
            version: REPO_VERSION,
            id: repo_id,
            created: Utc::now(),
            min_pack_size: config.repository.min_pack_size,
            max_blobs_per_pack: config.repository.max_blobs_per_pack,
        };
        let data = rmp_serde::to_vec_named(&repo_config)?;
        let content_hash = backend.hasher().map(|h| h.digest(&data));
        backend.save(&Handle::config(), &data, content_hash.as_ref())?;
        info!(location = %backend.location(), "initialized repository");
        Ok(Self::assemble(backend, repo_config, config))
    }

    /// Open a repository and load its index.
    pub fn open(backend: Arc<dyn Backend>, config: &BalerConfig) -> Result<Self> {
        let repo = Self::open_without_index(backend, config)?;
        repo.load_index(&CancelToken::new())?;
        Ok(repo)
    }

    /// Open a repository with an empty index. Callers load or build one
    /// themselves and install it with [`Repository::set_index`].
    pub fn open_without_index(backend: Arc<dyn Backend>, config: &BalerConfig) -> Result<Self> {
        let data = match backend.load_all(&Handle::config()) {
            Ok(data) => data,
            Err(BalerError::NotFound(_)) => {
                return Err(BalerError::RepoNotFound(backend.location()))
            }
            Err(e) => return Err(e),
        };
        let repo_config: RepoConfig = rmp_serde::from_slice(&data)?;
        if repo_config.version != REPO_VERSION {
            return Err(BalerError::UnsupportedVersion(repo_config.version));
        }
        Ok(Self::assemble(backend, repo_config, config))
    }

    fn assemble(backend: Arc<dyn Backend>, config: RepoConfig, settings: &BalerConfig) -> Self {
        let target = config.min_pack_size as usize;
        let max_blobs = config.max_blobs_per_pack;
        let max_age = Duration::from_secs(settings.repository.pack_max_age_secs);
        let index_config = settings.index.clone();
        Self {
            backend,
            index: RwLock::new(Arc::new(MasterIndex::new(&index_config))),
            writers: Mutex::new([
                PackWriter::new(BlobKind::Data, target, max_blobs, max_age),
                PackWriter::new(BlobKind::Tree, target, max_blobs, max_age),
            ]),
            config,
            index_config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn index_config(&self) -> &IndexConfig {
        &self.index_config
    }

    pub fn index(&self) -> Arc<MasterIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn set_index(&self, index: Arc<MasterIndex>) {
        *self.index.write().unwrap_or_else(|p| p.into_inner()) = index;
    }

    /// Replace the in-memory index with every index file in the backend.
    /// Fails on the first file that cannot be loaded.
    pub fn load_index(&self, cancel: &CancelToken) -> Result<()> {
        let mi = MasterIndex::new(&self.index_config);
        for_all_indexes(self.backend.as_ref(), &self.index_config, cancel, |id, res| {
            let index = res.map_err(|e| {
                warn!(index = %id, error = %e, "failed to load index");
                e
            })?;
            mi.insert(index)
        })?;
        info!(
            indexes = mi.finalized_count(),
            blobs = mi.len(),
            "loaded index"
        );
        self.set_index(Arc::new(mi));
        Ok(())
    }

    fn writers(&self) -> MutexGuard<'_, [PackWriter; 2]> {
        self.writers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store a blob. Unless `store_duplicate` is set, a blob already in the
    /// index or buffered for upload is not stored again.
    ///
    /// Returns the blob ID and whether it was already known.
    pub fn save_blob(
        &self,
        kind: BlobKind,
        data: &[u8],
        id: Option<BlobId>,
        store_duplicate: bool,
    ) -> Result<(BlobId, bool)> {
        let id = id.unwrap_or_else(|| BlobId::compute(data));
        let handle = BlobHandle::new(id, kind);
        let sealed = {
            let mut writers = self.writers();
            let writer = &mut writers[kind.slot()];
            if !store_duplicate
                && (writer.contains_pending(&id) || self.index().has(&handle))
            {
                return Ok((id, true));
            }
            writer.add_blob(id, data, 0)?;
            if writer.should_flush() {
                Some(writer.seal()?)
            } else {
                None
            }
        };
        if let Some(sealed) = sealed {
            self.upload(sealed)?;
        }
        Ok((id, false))
    }

    /// Write a sealed pack, then record its blobs in the index.
    fn upload(&self, sealed: SealedPack) -> Result<()> {
        let content_hash = self.backend.hasher().map(|h| h.digest(&sealed.bytes));
        match self
            .backend
            .save(&pack_handle(&sealed.id), &sealed.bytes, content_hash.as_ref())
        {
            Ok(()) => {}
            // Packs are named by their content: the existing object holds these bytes.
            Err(BalerError::AlreadyExists(_)) => {
                debug!(pack = %sealed.id, "pack already present");
            }
            Err(e) => return Err(e),
        }
        debug!(
            pack = %sealed.id,
            blobs = sealed.entries.len(),
            bytes = sealed.bytes.len(),
            "uploaded pack"
        );
        let index = self.index();
        index.store_pack(sealed.id, &sealed.entries)?;
        index.save_full(self.backend.as_ref())?;
        Ok(())
    }

    /// Seal and upload any partially filled packs.
    pub fn flush_packs(&self) -> Result<()> {
        let sealed: Vec<SealedPack> = {
            let mut writers = self.writers();
            let mut out = Vec::new();
            for w in writers.iter_mut() {
                if w.has_pending() {
                    out.push(w.seal()?);
                }
            }
            out
        };
        for s in sealed {
            self.upload(s)?;
        }
        Ok(())
    }

    /// Upload pending packs and persist the in-progress index.
    pub fn flush(&self) -> Result<()> {
        self.flush_packs()?;
        self.index().flush(self.backend.as_ref())?;
        Ok(())
    }

    /// Load a blob, trying each indexed copy until one matches its ID.
    pub fn load_blob(&self, kind: BlobKind, id: &BlobId) -> Result<Vec<u8>> {
        let handle = BlobHandle::new(*id, kind);
        let locations = self.index().lookup(&handle);
        let mut last_err = BalerError::BlobNotInIndex(handle);
        for pb in locations {
            match read_blob(self.backend.as_ref(), &pb.pack_id, pb.offset, pb.length) {
                Ok(data) => {
                    let actual = BlobId::compute(&data);
                    if actual == *id {
                        return Ok(data);
                    }
                    last_err = BalerError::HashMismatch {
                        what: format!("blob {handle} in pack {}", pb.pack_id),
                        expected: id.to_hex(),
                        actual: actual.to_hex(),
                    };
                }
                Err(e) => last_err = e,
            }
            warn!(blob = %handle, pack = %pb.pack_id, error = %last_err, "failed to load blob copy");
        }
        Err(last_err)
    }

    pub fn lookup_blob_size(&self, handle: &BlobHandle) -> Option<u32> {
        self.index().lookup_size(handle)
    }

    /// Visit every indexed blob location.
    pub fn list_blobs(&self, f: impl FnMut(PackedBlob)) {
        self.index().each(f);
    }

    pub fn save_tree(&self, tree: &Tree) -> Result<BlobId> {
        let data = tree.encode()?;
        let (id, _) = self.save_blob(BlobKind::Tree, &data, None, false)?;
        Ok(id)
    }

    pub fn load_tree(&self, id: &BlobId) -> Result<Tree> {
        Tree::decode(&self.load_blob(BlobKind::Tree, id)?)
    }

    /// Store a standalone object named by the hash of its content.
    pub fn save_unpacked(&self, file_type: FileType, data: &[u8]) -> Result<[u8; 32]> {
        let id = baler_types::id::hash_bytes(data);
        let content_hash = self.backend.hasher().map(|h| h.digest(data));
        self.backend.save(
            &Handle::new(file_type, hex::encode(id)),
            data,
            content_hash.as_ref(),
        )?;
        Ok(id)
    }

    /// Load a standalone object and verify it against its name.
    pub fn load_unpacked(&self, file_type: FileType, id: &[u8; 32]) -> Result<Vec<u8>> {
        let handle = Handle::new(file_type, hex::encode(id));
        let data = self.backend.load_all(&handle)?;
        let actual = baler_types::id::hash_bytes(&data);
        if actual != *id {
            return Err(BalerError::HashMismatch {
                what: handle.to_string(),
                expected: hex::encode(id),
                actual: hex::encode(actual),
            });
        }
        Ok(data)
    }

    pub fn remove_unpacked(&self, file_type: FileType, name: &str) -> Result<()> {
        self.backend.remove(&Handle::new(file_type, name))
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotId> {
        let id = self.save_unpacked(FileType::Snapshot, &snapshot.encode()?)?;
        Ok(SnapshotId(id))
    }

    pub fn load_snapshot(&self, id: &SnapshotId) -> Result<Snapshot> {
        Snapshot::decode(&self.load_unpacked(FileType::Snapshot, id.as_bytes())?)
    }

    pub fn remove_snapshot(&self, id: &SnapshotId) -> Result<()> {
        self.remove_unpacked(FileType::Snapshot, &id.to_hex())
    }

    /// IDs of all snapshots, sorted. Unparseable names are skipped.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        for info in self.backend.list(FileType::Snapshot)? {
            match SnapshotId::from_hex(&info.name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(name = %info.name, error = %e, "ignoring snapshot with invalid name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Pack files present in the backend with their sizes, sorted by ID.
    pub fn list_packs(&self) -> Result<Vec<(PackId, u64)>> {
        let mut packs = Vec::new();
        for info in self.backend.list(FileType::Pack)? {
            match PackId::from_hex(&info.name) {
                Ok(id) => packs.push((id, info.size)),
                Err(e) => warn!(name = %info.name, error = %e, "ignoring pack with invalid name"),
            }
        }
        packs.sort();
        Ok(packs)
    }

    pub fn remove_pack(&self, pack_id: &PackId) -> Result<()> {
        self.backend.remove(&pack_handle(pack_id))
    }
}

impl TreeSource for Repository {
    fn load_tree(&self, id: &BlobId) -> Result<Tree> {
        Repository::load_tree(self, id)
    }

    fn lookup_blob_size(&self, handle: &BlobHandle) -> Option<u32> {
        Repository::lookup_blob_size(self, handle)
    }
}
