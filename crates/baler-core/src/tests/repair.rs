use std::collections::BTreeSet;
use std::sync::Arc;

use baler_storage::{Backend, FileType, Handle, MemoryBackend};
use baler_types::{BlobHandle, BlobId, IndexId, PackId};

use crate::cancel::CancelToken;
use crate::checker::{check_repository, CheckError};
use crate::index::file::list_index_ids;
use crate::repair::{repair_index, RepairIndexOptions};
use crate::repo::pack::pack_handle;
use crate::testutil::{open_unindexed, reopen, rng, save_random_blobs, snapshot_of, test_config, test_repo};

/// Two flushed batches of data plus a snapshot over both.
fn two_generations() -> (Arc<MemoryBackend>, Vec<BlobId>) {
    let (backend, repo) = test_repo();
    let mut rng = rng(50);
    let mut blobs = save_random_blobs(&repo, &mut rng, 8);
    repo.flush().unwrap();
    blobs.extend(save_random_blobs(&repo, &mut rng, 8));
    repo.flush().unwrap();
    snapshot_of(&repo, &blobs);
    (backend, blobs)
}

fn index_ids(backend: &dyn Backend) -> BTreeSet<IndexId> {
    list_index_ids(backend).unwrap().into_iter().collect()
}

fn pack_count(backend: &MemoryBackend) -> usize {
    backend.count(FileType::Pack)
}

fn repair(backend: &Arc<MemoryBackend>, read_all_packs: bool) -> crate::repair::RepairStats {
    let repo = open_unindexed(backend.clone());
    repair_index(
        &repo,
        &RepairIndexOptions { read_all_packs },
        &CancelToken::new(),
    )
    .unwrap()
}

fn assert_all_indexed(backend: Arc<MemoryBackend>, blobs: &[BlobId]) {
    let repo = reopen(backend.clone());
    for id in blobs {
        assert!(repo.index().has(&BlobHandle::data(*id)));
    }
    let report =
        check_repository(repo, &test_config().check, true, &CancelToken::new()).unwrap();
    assert!(!report.has_errors(), "{:?}", report.findings);
}

#[test]
fn intact_index_is_trusted() {
    let (backend, blobs) = two_generations();
    let old = index_ids(backend.as_ref());

    let stats = repair(&backend, false);
    assert_eq!(stats.packs_trusted, pack_count(&backend));
    assert_eq!(stats.packs_read, 0);
    assert!(stats.packs_invalid.is_empty());
    assert!(stats.packs_dropped.is_empty());
    let removed: BTreeSet<IndexId> = stats.indexes_removed.iter().copied().collect();
    assert_eq!(removed, old);

    let written: BTreeSet<IndexId> = stats.indexes_written.iter().copied().collect();
    assert_eq!(index_ids(backend.as_ref()), written);
    assert_all_indexed(backend, &blobs);
}

#[test]
fn damaged_index_is_rebuilt_from_headers() {
    let (backend, blobs) = two_generations();
    let victim = *index_ids(backend.as_ref()).iter().next().unwrap();
    let handle = Handle::new(FileType::Index, victim.to_hex());
    let mut bytes = backend.load_all(&handle).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    backend.remove(&handle).unwrap();
    backend.save(&handle, &bytes, None).unwrap();
    assert!(reopen_fails(&backend));

    let stats = repair(&backend, false);
    assert!(stats.packs_read >= 1);
    assert_eq!(stats.packs_read + stats.packs_trusted, pack_count(&backend));
    assert!(stats.indexes_removed.contains(&victim));
    assert!(!index_ids(backend.as_ref()).contains(&victim));
    assert_all_indexed(backend, &blobs);
}

#[test]
fn missing_index_is_rebuilt_from_headers() {
    let (backend, blobs) = two_generations();
    let victim = *index_ids(backend.as_ref()).iter().next().unwrap();
    backend
        .remove(&Handle::new(FileType::Index, victim.to_hex()))
        .unwrap();

    let stats = repair(&backend, false);
    assert!(stats.packs_read >= 1);
    assert_eq!(stats.packs_read + stats.packs_trusted, pack_count(&backend));
    assert_all_indexed(backend, &blobs);
}

#[test]
fn missing_pack_is_dropped_from_index() {
    let (backend, repo) = test_repo();
    let mut rng = rng(51);
    let unused = save_random_blobs(&repo, &mut rng, 3);
    repo.flush().unwrap();
    let gone = repo.index().lookup(&BlobHandle::data(unused[0]))[0].pack_id;
    let used = save_random_blobs(&repo, &mut rng, 5);
    snapshot_of(&repo, &used);
    backend.remove(&pack_handle(&gone)).unwrap();

    let stats = repair(&backend, false);
    assert_eq!(stats.packs_dropped, vec![gone]);

    let repo = reopen(backend.clone());
    assert!(!repo.index().has(&BlobHandle::data(unused[0])));
    let report = check_repository(repo, &test_config().check, true, &CancelToken::new()).unwrap();
    assert!(report.findings.is_empty(), "{:?}", report.findings);
}

#[test]
fn read_all_packs_ignores_existing_index() {
    let (backend, blobs) = two_generations();
    let old = index_ids(backend.as_ref());

    let stats = repair(&backend, true);
    assert_eq!(stats.packs_trusted, 0);
    assert_eq!(stats.packs_read, pack_count(&backend));
    let removed: BTreeSet<IndexId> = stats.indexes_removed.iter().copied().collect();
    assert_eq!(removed, old);
    assert_all_indexed(backend, &blobs);
}

#[test]
fn unreadable_pack_is_left_out() {
    let (backend, blobs) = two_generations();
    let garbage = vec![0xab; 200];
    let bogus = PackId::compute(&garbage);
    backend.save(&pack_handle(&bogus), &garbage, None).unwrap();

    let stats = repair(&backend, false);
    assert_eq!(stats.packs_invalid, vec![bogus]);

    let repo = reopen(backend.clone());
    let report = check_repository(repo, &test_config().check, false, &CancelToken::new()).unwrap();
    assert!(!report.has_errors(), "{:?}", report.findings);
    assert!(report
        .findings
        .iter()
        .any(|e| matches!(e, CheckError::OrphanedPack { pack, .. } if *pack == bogus)));
    assert_all_indexed(backend, &blobs);
}

fn reopen_fails(backend: &Arc<MemoryBackend>) -> bool {
    crate::repo::Repository::open(backend.clone(), &test_config()).is_err()
}
