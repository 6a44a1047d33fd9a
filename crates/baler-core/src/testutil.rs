use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use baler_storage::{Backend, FileType, Handle, HashAlgorithm, MemoryBackend, ObjectInfo};
use baler_types::{BlobHandle, BlobId, BlobKind, Result, SnapshotId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cancel::Signal;
use crate::config::BalerConfig;
use crate::repo::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{Node, Tree, TreeSource};

/// Small packs and index files so tests exercise splitting and repacking.
pub fn test_config() -> BalerConfig {
    let mut config = BalerConfig::default();
    config.repository.min_pack_size = 4096;
    config.repository.max_blobs_per_pack = 64;
    config.index.initial_buckets = 4;
    config.index.arena_block_entries = 8;
    config.index.max_blobs_per_file = 100;
    config.check.workers = 4;
    config.check.error_queue_capacity = 8;
    config.check.track_unused = true;
    config
}

pub fn test_repo() -> (Arc<MemoryBackend>, Arc<Repository>) {
    let backend = Arc::new(MemoryBackend::new());
    let repo = Repository::init(Arc::clone(&backend) as Arc<dyn Backend>, &test_config()).unwrap();
    (backend, Arc::new(repo))
}

/// Open the repository in `backend` again, loading its index from scratch.
pub fn reopen(backend: Arc<dyn Backend>) -> Arc<Repository> {
    Arc::new(Repository::open(backend, &test_config()).unwrap())
}

/// Open without loading the index, for tests that load it themselves.
pub fn open_unindexed(backend: Arc<dyn Backend>) -> Arc<Repository> {
    Arc::new(Repository::open_without_index(backend, &test_config()).unwrap())
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_bytes(rng: &mut StdRng, min: usize, max: usize) -> Vec<u8> {
    let len = rng.gen_range(min..=max);
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}

/// Store `count` random data blobs.
pub fn save_random_blobs(repo: &Repository, rng: &mut StdRng, count: usize) -> Vec<BlobId> {
    (0..count)
        .map(|_| {
            let data = random_bytes(rng, 100, 600);
            repo.save_blob(BlobKind::Data, &data, None, false).unwrap().0
        })
        .collect()
}

/// A tree with one file per entry of `files`.
pub fn file_tree(files: &[(&str, Vec<BlobId>)]) -> Tree {
    let mut tree = Tree::new();
    for (name, content) in files {
        tree.insert(Node::file(name, content.clone(), 0)).unwrap();
    }
    tree
}

/// Store a snapshot whose root tree has one file per blob, flush, and
/// return the snapshot and root tree IDs.
pub fn snapshot_of(repo: &Repository, blobs: &[BlobId]) -> (SnapshotId, BlobId) {
    let files: Vec<(String, Vec<BlobId>)> = blobs
        .iter()
        .enumerate()
        .map(|(i, id)| (format!("file-{i:03}"), vec![*id]))
        .collect();
    let named: Vec<(&str, Vec<BlobId>)> = files
        .iter()
        .map(|(n, c)| (n.as_str(), c.clone()))
        .collect();
    let root = repo.save_tree(&file_tree(&named)).unwrap();
    repo.flush().unwrap();
    let snap = repo
        .save_snapshot(&Snapshot::new(root, vec!["/data".into()]))
        .unwrap();
    (snap, root)
}

/// Per pack, the absolute offset of the middle byte of every blob of `kind`.
pub fn blob_midpoints(repo: &Repository, kind: BlobKind) -> HashMap<String, Vec<u64>> {
    let mut out: HashMap<String, Vec<u64>> = HashMap::new();
    repo.list_blobs(|pb| {
        if pb.handle.kind == kind {
            out.entry(pb.pack_id.to_hex())
                .or_default()
                .push(u64::from(pb.offset) + u64::from(pb.length / 2));
        }
    });
    out
}

fn flip_targets(targets: &[u64], handle: &Handle, offset: u64, buf: &mut [u8]) -> bool {
    let mut flipped = false;
    for &at in targets {
        if at >= offset && at < offset + buf.len() as u64 {
            buf[(at - offset) as usize] ^= 0x01;
            flipped = true;
        }
    }
    if flipped {
        tracing::debug!(handle = %handle, "test backend corrupted a read");
    }
    flipped
}

/// Flips the target bytes of pack files on every read.
pub struct CorruptEveryRead {
    inner: Arc<dyn Backend>,
    targets: HashMap<String, Vec<u64>>,
}

impl CorruptEveryRead {
    pub fn new(inner: Arc<dyn Backend>, targets: HashMap<String, Vec<u64>>) -> Self {
        Self { inner, targets }
    }
}

/// Flips the target bytes of each pack file on its first affected read only.
pub struct CorruptFirstRead {
    inner: Arc<dyn Backend>,
    targets: HashMap<String, Vec<u64>>,
    corrupted: Mutex<HashSet<String>>,
}

impl CorruptFirstRead {
    pub fn new(inner: Arc<dyn Backend>, targets: HashMap<String, Vec<u64>>) -> Self {
        Self {
            inner,
            targets,
            corrupted: Mutex::new(HashSet::new()),
        }
    }
}

macro_rules! delegate_backend {
    () => {
        fn location(&self) -> String {
            self.inner.location()
        }

        fn list(&self, file_type: FileType) -> Result<Vec<ObjectInfo>> {
            self.inner.list(file_type)
        }

        fn save(
            &self,
            handle: &Handle,
            data: &[u8],
            content_hash: Option<&[u8; 32]>,
        ) -> Result<()> {
            self.inner.save(handle, data, content_hash)
        }

        fn remove(&self, handle: &Handle) -> Result<()> {
            self.inner.remove(handle)
        }

        fn hasher(&self) -> Option<HashAlgorithm> {
            self.inner.hasher()
        }
    };
}

impl Backend for CorruptEveryRead {
    delegate_backend!();

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = self.inner.load(handle, offset, length)?;
        if handle.file_type == FileType::Pack {
            if let Some(targets) = self.targets.get(&handle.name) {
                flip_targets(targets, handle, offset, &mut buf);
            }
        }
        Ok(buf)
    }
}

impl Backend for CorruptFirstRead {
    delegate_backend!();

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = self.inner.load(handle, offset, length)?;
        if handle.file_type != FileType::Pack {
            return Ok(buf);
        }
        let Some(targets) = self.targets.get(&handle.name) else {
            return Ok(buf);
        };
        let mut corrupted = self.corrupted.lock().unwrap();
        if !corrupted.contains(&handle.name) && flip_targets(targets, handle, offset, &mut buf) {
            corrupted.insert(handle.name.clone());
        }
        Ok(buf)
    }
}

/// Counts tree loads per ID.
pub struct CountingTreeSource {
    inner: Arc<dyn TreeSource>,
    loads: Mutex<HashMap<BlobId, usize>>,
}

impl CountingTreeSource {
    pub fn new(inner: Arc<dyn TreeSource>) -> Self {
        Self {
            inner,
            loads: Mutex::new(HashMap::new()),
        }
    }

    pub fn loads(&self) -> HashMap<BlobId, usize> {
        self.loads.lock().unwrap().clone()
    }
}

impl TreeSource for CountingTreeSource {
    fn load_tree(&self, id: &BlobId) -> Result<Tree> {
        *self.loads.lock().unwrap().entry(*id).or_default() += 1;
        self.inner.load_tree(id)
    }

    fn lookup_blob_size(&self, handle: &BlobHandle) -> Option<u32> {
        self.inner.lookup_blob_size(handle)
    }
}

/// Holds back the load of one tree until some worker looks up one blob,
/// forcing two traversals to overlap.
pub struct DelayedTreeSource {
    inner: Arc<dyn TreeSource>,
    delay_tree: BlobId,
    unblock: BlobHandle,
    released: Signal,
    timeout: Duration,
    timed_out: Mutex<bool>,
}

impl DelayedTreeSource {
    pub fn new(inner: Arc<dyn TreeSource>, delay_tree: BlobId, unblock: BlobHandle) -> Self {
        Self {
            inner,
            delay_tree,
            unblock,
            released: Signal::new(),
            timeout: Duration::from_secs(10),
            timed_out: Mutex::new(false),
        }
    }

    /// Whether the delayed load gave up waiting.
    pub fn timed_out(&self) -> bool {
        *self.timed_out.lock().unwrap()
    }
}

impl TreeSource for DelayedTreeSource {
    fn load_tree(&self, id: &BlobId) -> Result<Tree> {
        if *id == self.delay_tree && !self.released.wait_timeout(self.timeout) {
            *self.timed_out.lock().unwrap() = true;
        }
        self.inner.load_tree(id)
    }

    fn lookup_blob_size(&self, handle: &BlobHandle) -> Option<u32> {
        if *handle == self.unblock {
            self.released.fire();
        }
        self.inner.lookup_blob_size(handle)
    }
}
