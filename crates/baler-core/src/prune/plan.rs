use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use baler_types::{BalerError, BlobHandle, BlobKind, PackId, Result};
use tracing::{debug, info, warn};

use super::{PruneOptions, PruneStats};
use crate::cancel::CancelToken;
use crate::index::PackedBlob;
use crate::repo::pack::{expected_pack_size, PackEntry};
use crate::repo::Repository;

/// Decisions of one prune run, ready to [`execute`](PrunePlan::execute).
pub struct PrunePlan {
    pub(super) repo: Arc<Repository>,
    pub(super) unsafe_recovery: bool,
    /// Packs in the backend that no index lists.
    pub remove_packs_first: HashSet<PackId>,
    /// Packs whose used blobs are copied into new packs before removal.
    pub repack_packs: HashSet<PackId>,
    /// Packs without any used blob.
    pub remove_packs: HashSet<PackId>,
    /// Indexed packs missing from the backend that hold nothing in use.
    pub ignore_packs: HashSet<PackId>,
    /// Used blobs that only live in packs being repacked.
    pub keep_blobs: HashSet<BlobHandle>,
    pub stats: PruneStats,
}

impl PrunePlan {
    /// Whether executing the plan would change the repository.
    pub fn is_noop(&self) -> bool {
        self.remove_packs_first.is_empty()
            && self.repack_packs.is_empty()
            && self.remove_packs.is_empty()
            && self.ignore_packs.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PackInfo {
    kind: Option<BlobKind>,
    mixed: bool,
    used_size: u64,
    unused_size: u64,
    used_blobs: u64,
    unused_blobs: u64,
    duplicate_blobs: u64,
}

impl PackInfo {
    fn size(&self) -> u64 {
        self.used_size + self.unused_size
    }

    /// Pure data packs are the ones the unused-space limit applies to.
    fn is_data(&self) -> bool {
        !self.mixed && self.kind == Some(BlobKind::Data)
    }

    fn note_kind(&mut self, kind: BlobKind) {
        match self.kind {
            None => self.kind = Some(kind),
            Some(k) if k != kind => self.mixed = true,
            Some(_) => {}
        }
    }
}

/// Compute what to keep, repack and remove.
///
/// `collect_used` fills the set of blobs that must survive. Planning fails
/// when a used blob is not indexed, when a pack holding used blobs is missing
/// or when such a pack's size disagrees with the index.
pub fn plan_prune<F>(
    opts: &PruneOptions,
    repo: &Arc<Repository>,
    collect_used: F,
    cancel: &CancelToken,
) -> Result<PrunePlan>
where
    F: FnOnce(&mut HashSet<BlobHandle>) -> Result<()>,
{
    let mut used = HashSet::new();
    collect_used(&mut used)?;
    cancel.check()?;
    info!(used = used.len(), "prune: planning");

    let index = repo.index();
    let by_pack = index.each_by_pack(None);
    let mut stats = PruneStats::default();

    // Copies of each used blob: 0 missing, 1 unique, 2+ duplicated.
    let mut copies: HashMap<BlobHandle, u8> = used.iter().map(|h| (*h, 0)).collect();
    for blobs in by_pack.values() {
        for b in blobs {
            if let Some(n) = copies.get_mut(&b.handle) {
                *n = n.saturating_add(1);
            }
        }
    }
    let missing = copies.values().filter(|&&n| n == 0).count();
    if missing > 0 {
        for (h, _) in copies.iter().filter(|(_, n)| **n == 0) {
            warn!(blob = %h, "used blob not found in index");
        }
        return Err(BalerError::BlobsMissing(missing));
    }

    let mut infos: HashMap<PackId, PackInfo> = HashMap::with_capacity(by_pack.len());
    let mut has_duplicates = false;
    for (pack, blobs) in &by_pack {
        let overhead = pack_overhead(blobs)?;
        let mut info = PackInfo {
            used_size: overhead,
            ..PackInfo::default()
        };
        for b in blobs {
            info.note_kind(b.handle.kind);
            let size = u64::from(b.length);
            match copies.get(&b.handle).copied().unwrap_or(0) {
                n if n >= 2 => {
                    has_duplicates = true;
                    info.unused_size += size;
                    info.unused_blobs += 1;
                    info.duplicate_blobs += 1;
                    stats.size.duplicate += size;
                    stats.blobs.duplicate += 1;
                }
                1 => {
                    info.used_size += size;
                    info.used_blobs += 1;
                    stats.size.used += size;
                    stats.blobs.used += 1;
                }
                _ => {
                    info.unused_size += size;
                    info.unused_blobs += 1;
                    stats.size.unused += size;
                    stats.blobs.unused += 1;
                }
            }
        }
        infos.insert(*pack, info);
    }

    // Keep exactly one copy of every duplicated blob. A copy is kept when its
    // pack already holds used blobs, when the pack consists only of
    // duplicates (the output of an interrupted prune) or when it is the last
    // copy left.
    if has_duplicates {
        for (pack, blobs) in &by_pack {
            for b in blobs {
                let Some(count) = copies.get_mut(&b.handle) else {
                    continue;
                };
                if *count == 1 {
                    continue;
                }
                let Some(info) = infos.get_mut(pack) else {
                    continue;
                };
                let size = u64::from(b.length);
                if info.used_blobs > 0
                    || info.duplicate_blobs == info.unused_blobs
                    || *count == 0
                {
                    info.used_size += size;
                    info.used_blobs += 1;
                    info.unused_size -= size;
                    info.unused_blobs -= 1;
                    stats.size.used += size;
                    stats.blobs.used += 1;
                    stats.size.duplicate -= size;
                    stats.blobs.duplicate -= 1;
                    *count = 1;
                } else {
                    *count -= 1;
                    if *count == 1 {
                        // 1 would read as "never duplicated"; 0 selects the
                        // next copy seen.
                        *count = 0;
                    }
                }
            }
        }
    }
    if copies.values().any(|&n| n != 1) {
        return Err(BalerError::Other(
            "prune: internal error selecting duplicate blobs".into(),
        ));
    }

    let pack_size = u64::from(repo.config().min_pack_size);
    let target = if opts.repack_small {
        pack_size / 5 * 4
    } else {
        pack_size / 25
    };

    let mut remove_packs_first = HashSet::new();
    let mut remove_packs = HashSet::new();
    let mut candidates: Vec<(PackId, PackInfo)> = Vec::new();
    let mut small_candidates: Vec<(PackId, PackInfo)> = Vec::new();

    for (pack, actual) in repo.list_packs()? {
        cancel.check()?;
        let Some(info) = infos.remove(&pack) else {
            debug!(pack = %pack, size = actual, "prune: removing unindexed pack");
            remove_packs_first.insert(pack);
            stats.size.unreferenced += actual;
            continue;
        };
        if info.size() != actual && info.used_blobs != 0 {
            return Err(BalerError::PackSizeMismatch {
                pack,
                expected: info.size(),
                actual,
            });
        }

        if info.used_blobs == 0 {
            stats.packs.unused += 1;
        } else if info.unused_blobs == 0 {
            stats.packs.used += 1;
        } else {
            stats.packs.partly_used += 1;
        }

        if info.used_blobs == 0 {
            remove_packs.insert(pack);
            stats.blobs.remove += info.unused_blobs;
            stats.size.remove += info.unused_size;
        } else if opts.repack_cacheable_only && info.is_data() {
            stats.packs.keep += 1;
        } else if info.unused_blobs == 0 && !info.mixed {
            if actual >= target {
                stats.packs.keep += 1;
            } else {
                small_candidates.push((pack, info));
            }
        } else {
            candidates.push((pack, info));
        }
    }

    // Whatever is left is indexed but absent from the backend.
    let mut ignore_packs = HashSet::new();
    let mut needed_missing = Vec::new();
    for (pack, info) in infos {
        if info.used_blobs == 0 {
            warn!(pack = %pack, "prune: forgetting missing unused pack");
            ignore_packs.insert(pack);
            stats.blobs.remove += info.unused_blobs;
            stats.size.remove += info.unused_size;
        } else {
            warn!(pack = %pack, "prune: needed pack is missing");
            needed_missing.push(pack);
        }
    }
    if !needed_missing.is_empty() {
        needed_missing.sort();
        return Err(BalerError::PacksMissing(needed_missing));
    }

    if small_candidates.len() < opts.small_pack_min_count {
        stats.packs.keep += small_candidates.len() as u64;
    } else {
        candidates.append(&mut small_candidates);
    }

    if opts.unsafe_recovery {
        stats.packs.keep += candidates.len() as u64;
        candidates.clear();
    }
    candidates.sort_by(|a, b| repack_order(&a.1, &b.1, target));

    let mut repack_packs = HashSet::new();
    let max_unused_after = (opts.max_unused_bytes)(stats.size.used);
    for (pack, info) in candidates {
        let reached_unused_limit = stats.unused_after() < max_unused_after;
        let reached_repack_limit =
            stats.size.repack.saturating_add(info.size()) >= opts.max_repack_bytes;
        let large_enough = info.size() >= target;

        let repack = if reached_repack_limit {
            false
        } else if !info.is_data() {
            true
        } else {
            !(reached_unused_limit && large_enough)
        };
        if repack {
            repack_packs.insert(pack);
            stats.blobs.repack += info.used_blobs + info.unused_blobs;
            stats.size.repack += info.size();
            stats.blobs.repack_remove += info.unused_blobs;
            stats.size.repack_remove += info.unused_size;
        } else {
            stats.packs.keep += 1;
        }
    }

    stats.packs.unreferenced = remove_packs_first.len() as u64;
    stats.packs.repack = repack_packs.len() as u64;
    stats.packs.remove = remove_packs.len() as u64;

    let mut keep_blobs = HashSet::new();
    if !repack_packs.is_empty() {
        keep_blobs = used;
        for (pack, blobs) in &by_pack {
            if remove_packs.contains(pack) || repack_packs.contains(pack) {
                continue;
            }
            for b in blobs {
                keep_blobs.remove(&b.handle);
            }
        }
    }

    stats.log();
    Ok(PrunePlan {
        repo: Arc::clone(repo),
        unsafe_recovery: opts.unsafe_recovery,
        remove_packs_first,
        repack_packs,
        remove_packs,
        ignore_packs,
        keep_blobs,
        stats,
    })
}

/// Bytes of a pack not covered by blob contents: preamble, length prefixes,
/// header and trailer.
fn pack_overhead(blobs: &[PackedBlob]) -> Result<u64> {
    let entries: Vec<PackEntry> = blobs.iter().map(PackedBlob::to_entry).collect();
    let content: u64 = blobs.iter().map(|b| u64::from(b.length)).sum();
    Ok(expected_pack_size(&entries)? - content)
}

/// Tree and mixed packs first, then packs below `target`, then by descending
/// share of unused bytes.
fn repack_order(a: &PackInfo, b: &PackInfo, target: u64) -> Ordering {
    match (a.is_data(), b.is_data()) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }
    match (a.size() < target, b.size() < target) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let lhs = u128::from(a.unused_size) * u128::from(b.used_size);
    let rhs = u128::from(b.unused_size) * u128::from(a.used_size);
    rhs.cmp(&lhs)
}
