use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use baler_storage::{Backend, FileType, Handle, HashAlgorithm, MemoryBackend, ObjectInfo};
use baler_types::{BalerError, BlobHandle, BlobKind, IndexId, Result};

use crate::cancel::CancelToken;
use crate::index::file::{list_index_ids, load_index};
use crate::index::RewriteOptions;
use crate::testutil::{reopen, rng, save_random_blobs, test_config, test_repo};

/// Refuses to store index files; everything else passes through.
struct NoIndexWrites {
    inner: Arc<dyn Backend>,
}

impl Backend for NoIndexWrites {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn list(&self, file_type: FileType) -> Result<Vec<ObjectInfo>> {
        self.inner.list(file_type)
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.inner.load(handle, offset, length)
    }

    fn save(&self, handle: &Handle, data: &[u8], content_hash: Option<&[u8; 32]>) -> Result<()> {
        if handle.file_type == FileType::Index {
            return Err(BalerError::Storage("index writes disabled".into()));
        }
        self.inner.save(handle, data, content_hash)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.inner.remove(handle)
    }

    fn hasher(&self) -> Option<HashAlgorithm> {
        self.inner.hasher()
    }
}

/// Three flushes of `per_batch` random blobs, so three index files.
fn three_generations(per_batch: usize) -> (Arc<MemoryBackend>, usize) {
    let (backend, repo) = test_repo();
    let mut rng = rng(11);
    for _ in 0..3 {
        save_random_blobs(&repo, &mut rng, per_batch);
        repo.flush().unwrap();
    }
    (backend, 3 * per_batch)
}

#[test]
fn flush_writes_one_file_per_generation() {
    let (backend, k) = three_generations(5);
    assert_eq!(backend.count(FileType::Index), 3);
    let repo = reopen(backend);
    assert_eq!(repo.index().len(), k);
    assert_eq!(repo.index().finalized_count(), 3);
}

#[test]
fn merging_k_entries_keeps_k_entries() {
    let (backend, k) = three_generations(7);
    let repo = reopen(backend);
    let index = repo.index();
    let ids_before = index.ids();

    index.merge_final_indexes().unwrap();
    assert_eq!(index.finalized_count(), 1);
    assert_eq!(index.len(), k);
    assert_eq!(index.ids(), ids_before);
}

#[test]
fn rewrite_replaces_files_and_keeps_entries() {
    let (backend, k) = three_generations(7);
    let repo = reopen(Arc::clone(&backend) as Arc<dyn Backend>);
    let old: BTreeSet<IndexId> = repo.index().ids();

    let stats = repo
        .index()
        .rewrite(
            backend.as_ref(),
            &RewriteOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(stats.entries, k);
    assert_eq!(stats.removed.len(), old.len());

    let on_disk: BTreeSet<IndexId> = list_index_ids(backend.as_ref()).unwrap().into_iter().collect();
    let written: BTreeSet<IndexId> = stats.written.iter().copied().collect();
    assert_eq!(on_disk, written);
    assert!(on_disk.is_disjoint(&old));

    for id in &stats.written {
        let idx = load_index(backend.as_ref(), id, &test_config().index).unwrap();
        let supersedes: BTreeSet<IndexId> = idx.supersedes().into_iter().collect();
        assert_eq!(supersedes, old);
    }
    assert_eq!(reopen(backend).index().len(), k);
}

#[test]
fn rewrite_splits_large_indexes() {
    // max_blobs_per_file is 100 in the test config.
    let (backend, repo) = test_repo();
    let mut rng = rng(5);
    save_random_blobs(&repo, &mut rng, 250);
    repo.flush().unwrap();

    let stats = repo
        .index()
        .rewrite(
            backend.as_ref(),
            &RewriteOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
    assert!(stats.written.len() >= 3);
    for id in &stats.written {
        let idx = load_index(backend.as_ref(), id, &test_config().index).unwrap();
        assert!(idx.len() <= 100);
    }
    assert_eq!(stats.entries, 250);
}

#[test]
fn rewrite_excludes_packs() {
    let (backend, repo) = test_repo();
    let mut rng = rng(8);
    let first = save_random_blobs(&repo, &mut rng, 3);
    repo.flush().unwrap();
    let second = save_random_blobs(&repo, &mut rng, 3);
    repo.flush().unwrap();

    let dropped = repo.index().lookup(&BlobHandle::data(first[0]))[0].pack_id;
    let exclude: HashSet<_> = [dropped].into_iter().collect();
    repo.index()
        .rewrite(
            backend.as_ref(),
            &RewriteOptions {
                exclude_packs: exclude,
                ..RewriteOptions::default()
            },
            &CancelToken::new(),
        )
        .unwrap();

    let reopened = reopen(backend);
    for id in &first {
        assert!(!reopened.index().has(&BlobHandle::data(*id)));
    }
    for id in &second {
        assert!(reopened.index().has(&BlobHandle::data(*id)));
    }
}

#[test]
fn failed_rewrite_keeps_old_generation() {
    let (backend, k) = three_generations(4);
    let failing: Arc<dyn Backend> = Arc::new(NoIndexWrites {
        inner: Arc::clone(&backend) as Arc<dyn Backend>,
    });
    let repo = reopen(Arc::clone(&failing));
    let before = repo.index().ids();

    let err = repo
        .index()
        .rewrite(failing.as_ref(), &RewriteOptions::default(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BalerError::Storage(_)));

    assert_eq!(repo.index().ids(), before);
    assert_eq!(repo.index().len(), k);
    let on_disk: BTreeSet<IndexId> = list_index_ids(backend.as_ref()).unwrap().into_iter().collect();
    assert_eq!(on_disk, before);
}

#[test]
fn duplicate_locations_survive_rewrite() {
    let (backend, repo) = test_repo();
    let (id, _) = repo
        .save_blob(BlobKind::Data, b"twice stored", None, false)
        .unwrap();
    repo.flush().unwrap();
    repo.save_blob(BlobKind::Data, b"twice stored", None, true)
        .unwrap();
    repo.flush().unwrap();

    repo.index()
        .rewrite(
            backend.as_ref(),
            &RewriteOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
    let reopened = reopen(backend);
    assert_eq!(reopened.index().lookup(&BlobHandle::data(id)).len(), 2);
}

#[test]
fn in_progress_entries_visible_before_flush() {
    let (backend, repo) = test_repo();
    let mut rng = rng(3);
    let ids = save_random_blobs(&repo, &mut rng, 30);
    // 30 blobs of at least 100 bytes overflow one 4 KiB pack.
    assert!(backend.count(FileType::Pack) >= 1);
    let uploaded = ids
        .iter()
        .filter(|id| repo.index().has(&BlobHandle::data(**id)))
        .count();
    assert!(uploaded > 0);
    assert_eq!(backend.count(FileType::Index), 0);
    repo.flush().unwrap();
    assert_eq!(backend.count(FileType::Index), 1);
    for id in &ids {
        assert!(repo.index().has(&BlobHandle::data(*id)));
    }
}
