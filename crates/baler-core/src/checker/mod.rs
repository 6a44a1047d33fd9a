//! Repository verification.
//!
//! A [`Checker`] first loads every index file itself, then runs up to three
//! phases: `packs` compares the index with the pack listing, `structure`
//! walks every snapshot's tree graph and `read_data` re-hashes pack contents.
//! Phases stream their findings into a bounded channel; [`Checker::collect`]
//! runs a phase and gathers what it reports.

pub mod error;
mod read_data;
mod structure;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use baler_types::{BalerError, BlobHandle, BlobId, IndexId, PackId, Result, SnapshotId};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::cancel::{send_or_cancel, CancelToken};
use crate::config::CheckConfig;
use crate::index::file::for_all_indexes;
use crate::index::{Index, MasterIndex, PackedBlob};
use crate::repo::pack::{expected_pack_size, PackEntry};
use crate::repo::Repository;
use crate::tree::TreeSource;

pub use self::error::{CheckError, Severity, TreeIssue};
pub use self::structure::TreeFilter;

pub struct Checker {
    repo: Arc<Repository>,
    source: Arc<dyn TreeSource>,
    config: CheckConfig,
    pool: rayon::ThreadPool,
    index: Arc<MasterIndex>,
    /// Expected on-disk size of every indexed pack.
    packs: BTreeMap<PackId, u64>,
    roots: Vec<(SnapshotId, BlobId)>,
    snapshot_errors: Vec<CheckError>,
    used: Option<Mutex<HashSet<BlobHandle>>>,
    /// Set when `structure` skipped a tree through its exclude filter.
    excluded_trees: AtomicBool,
}

impl Checker {
    pub fn new(repo: Arc<Repository>, config: &CheckConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .thread_name(|i| format!("baler-check-{i}"))
            .build()
            .map_err(|e| BalerError::Other(format!("failed to build check pool: {e}")))?;
        let source: Arc<dyn TreeSource> = Arc::clone(&repo) as Arc<dyn TreeSource>;
        Ok(Self {
            index: repo.index(),
            repo,
            source,
            config: config.clone(),
            pool,
            packs: BTreeMap::new(),
            roots: Vec::new(),
            snapshot_errors: Vec::new(),
            used: config.track_unused.then(|| Mutex::new(HashSet::new())),
            excluded_trees: AtomicBool::new(false),
        })
    }

    /// Load trees and blob sizes through `source` instead of the repository.
    pub fn with_tree_source(mut self, source: Arc<dyn TreeSource>) -> Self {
        self.source = source;
        self
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Run `phase` on a scoped thread and gather everything it reports.
    pub fn collect<F>(&self, phase: F) -> Vec<CheckError>
    where
        F: FnOnce(&Sender<CheckError>) + Send,
    {
        let (tx, rx) = crossbeam_channel::bounded(self.config.error_queue_capacity);
        std::thread::scope(|s| {
            s.spawn(move || phase(&tx));
            rx.iter().collect()
        })
    }

    /// Load every index file and install the result as the repository index.
    ///
    /// Returns `(hints, errors)`. Index files whose content does not hash to
    /// their name are errors and are left out; the others are still used.
    pub fn load_index(&mut self, cancel: &CancelToken) -> (Vec<CheckError>, Vec<CheckError>) {
        let mut hints = Vec::new();
        let mut errors = Vec::new();
        let index_config = self.repo.index_config().clone();

        let loaded: Mutex<Vec<(IndexId, Result<Index>)>> = Mutex::new(Vec::new());
        let walk = for_all_indexes(
            self.repo.backend().as_ref(),
            &index_config,
            cancel,
            |id, res| {
                loaded
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push((id, res));
                Ok(())
            },
        );
        if let Err(e) = walk {
            errors.push(match e {
                BalerError::Cancelled => CheckError::Cancelled,
                e => CheckError::IndexList {
                    reason: e.to_string(),
                },
            });
        }
        let mut loaded = loaded.into_inner().unwrap_or_else(|p| p.into_inner());
        loaded.sort_by_key(|(id, _)| *id);

        let mi = MasterIndex::new(&index_config);
        let mut pack_to_index: BTreeMap<PackId, BTreeSet<IndexId>> = BTreeMap::new();
        for (id, res) in loaded {
            let index = match res {
                Ok(index) => index,
                Err(e) => {
                    warn!(index = %id, error = %e, "index file failed to load");
                    errors.push(CheckError::IndexCorrupt {
                        index: id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            for pack in index.packs() {
                pack_to_index.entry(pack).or_default().insert(id);
            }
            if let Err(e) = mi.insert(index) {
                errors.push(CheckError::IndexCorrupt {
                    index: id,
                    reason: e.to_string(),
                });
            }
        }
        if let Err(e) = mi.merge_final_indexes() {
            warn!(error = %e, "merging loaded indexes failed");
        }

        for (pack, indexes) in pack_to_index {
            if indexes.len() > 1 {
                hints.push(CheckError::DuplicatePacks {
                    pack,
                    indexes: indexes.into_iter().collect(),
                });
            }
        }

        hints.extend(
            mi.mixed_packs()
                .into_iter()
                .map(|pack| CheckError::MixedPack { pack }),
        );

        self.packs.clear();
        for (pack, blobs) in mi.each_by_pack(None) {
            let entries: Vec<PackEntry> = blobs.iter().map(PackedBlob::to_entry).collect();
            match expected_pack_size(&entries) {
                Ok(size) => {
                    self.packs.insert(pack, size);
                }
                Err(e) => warn!(pack = %pack, error = %e, "cannot compute expected pack size"),
            }
        }

        let mi = Arc::new(mi);
        self.repo.set_index(Arc::clone(&mi));
        self.index = mi;
        info!(
            packs = self.packs.len(),
            blobs = self.index.len(),
            hints = hints.len(),
            errors = errors.len(),
            "check: index loaded"
        );
        (hints, errors)
    }

    /// Load all snapshots and remember their root trees for `structure`.
    /// Damaged snapshots are reported by `structure`.
    pub fn load_snapshots(&mut self, cancel: &CancelToken) -> Result<()> {
        self.roots.clear();
        self.snapshot_errors.clear();
        for id in self.repo.list_snapshots()? {
            cancel.check()?;
            match self.repo.load_snapshot(&id) {
                Ok(snapshot) => match snapshot.tree {
                    Some(tree) => self.roots.push((id, tree)),
                    None => self
                        .snapshot_errors
                        .push(CheckError::SnapshotNoTree { snapshot: id }),
                },
                Err(e) => self.snapshot_errors.push(CheckError::SnapshotLoad {
                    snapshot: id,
                    reason: e.to_string(),
                }),
            }
        }
        debug!(
            snapshots = self.roots.len(),
            damaged = self.snapshot_errors.len(),
            "check: snapshots loaded"
        );
        Ok(())
    }

    /// Compare indexed packs with the backend listing.
    pub fn packs(&self, cancel: &CancelToken, tx: &Sender<CheckError>) {
        let listed = match self.repo.list_packs() {
            Ok(listed) => listed,
            Err(e) => {
                send_or_cancel(
                    tx,
                    cancel,
                    CheckError::PackList {
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };
        let present: HashMap<PackId, u64> = listed.iter().copied().collect();

        for (pack, expected) in &self.packs {
            let found = match present.get(pack) {
                None => CheckError::MissingPack { pack: *pack },
                Some(&actual) if actual != *expected => CheckError::PackSizeMismatch {
                    pack: *pack,
                    expected: *expected,
                    actual,
                },
                Some(_) => continue,
            };
            if !send_or_cancel(tx, cancel, found) {
                return;
            }
        }
        for (pack, size) in listed {
            if self.packs.contains_key(&pack) {
                continue;
            }
            debug!(pack = %pack, size, "pack not referenced in index");
            if !send_or_cancel(tx, cancel, CheckError::OrphanedPack { pack, size }) {
                return;
            }
        }
    }

    /// Indexed blobs never reached during `structure`, sorted.
    ///
    /// Fails if `structure` ran with an exclude filter that skipped a tree,
    /// since the contents of skipped trees were never seen.
    pub fn unused_blobs(&self, cancel: &CancelToken) -> Result<Vec<BlobHandle>> {
        let used = self.used.as_ref().ok_or_else(|| {
            BalerError::Other("checker was created without unused-blob tracking".into())
        })?;
        if self.excluded_trees.load(Ordering::Relaxed) {
            return Err(BalerError::Other(
                "unused blobs are unknown after excluding trees from the structure check".into(),
            ));
        }
        cancel.check()?;
        let used = used.lock().unwrap_or_else(|p| p.into_inner());
        let mut unused = BTreeSet::new();
        self.index.each(|pb| {
            if !used.contains(&pb.handle) {
                unused.insert(pb.handle);
            }
        });
        Ok(unused.into_iter().collect())
    }

    pub(super) fn note_excluded(&self, id: &BlobId) {
        debug!(tree = %id, "check: tree excluded");
        self.excluded_trees.store(true, Ordering::Relaxed);
    }

    fn mark_used(&self, handle: BlobHandle) {
        if let Some(used) = &self.used {
            used.lock().unwrap_or_else(|p| p.into_inner()).insert(handle);
        }
    }
}

/// Everything one full check run found.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub findings: Vec<CheckError>,
}

impl CheckReport {
    pub fn errors(&self) -> impl Iterator<Item = &CheckError> {
        self.findings.iter().filter(|e| e.is_error())
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|e| e.severity() == severity)
            .count()
    }
}

/// Run index loading, `packs`, `structure` and optionally `read_data`.
pub fn check_repository(
    repo: Arc<Repository>,
    config: &CheckConfig,
    read_data: bool,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let mut checker = Checker::new(repo, config)?;
    let mut report = CheckReport::default();
    let (hints, errors) = checker.load_index(cancel);
    report.findings.extend(hints);
    report.findings.extend(errors);
    checker.load_snapshots(cancel)?;

    report
        .findings
        .extend(checker.collect(|tx| checker.packs(cancel, tx)));
    report
        .findings
        .extend(checker.collect(|tx| checker.structure(cancel, None, tx)));
    if read_data {
        report
            .findings
            .extend(checker.collect(|tx| checker.read_data(cancel, tx)));
    }
    cancel.check()?;
    info!(
        findings = report.findings.len(),
        errors = report.errors().count(),
        "check finished"
    );
    Ok(report)
}
