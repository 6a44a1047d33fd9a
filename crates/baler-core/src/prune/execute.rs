use std::collections::HashSet;

use baler_storage::FileType;
use baler_types::{BalerError, BlobHandle, BlobId, PackId, Result};
use tracing::{debug, info, warn};

use super::PrunePlan;
use crate::cancel::CancelToken;
use crate::index::RewriteOptions;
use crate::repo::pack::pack_handle;
use crate::repo::Repository;

impl PrunePlan {
    /// Apply the plan.
    ///
    /// Unindexed packs go first. Used blobs from repacked packs are written
    /// to new packs and a new index generation is flushed. The index is then
    /// rewritten without the dropped packs and only after that are those
    /// packs deleted. An error at any point leaves the previous index
    /// generation usable.
    ///
    /// With `unsafe_recovery` the old index files are deleted before the
    /// packs and a replacement index is written afterwards.
    pub fn execute(&self, cancel: &CancelToken) -> Result<()> {
        let repo = self.repo.as_ref();
        if self.is_noop() {
            info!("prune: nothing to do");
            return Ok(());
        }

        if !self.remove_packs_first.is_empty() {
            info!(
                packs = self.remove_packs_first.len(),
                "prune: deleting unindexed packs"
            );
            delete_packs(repo, &self.remove_packs_first, cancel)?;
        }

        let mut remove = self.remove_packs.clone();
        if !self.repack_packs.is_empty() {
            info!(
                packs = self.repack_packs.len(),
                blobs = self.keep_blobs.len(),
                "prune: repacking"
            );
            repack(repo, &self.repack_packs, &self.keep_blobs, cancel)?;
            remove.extend(self.repack_packs.iter().copied());
        }

        let mut exclude = remove.clone();
        exclude.extend(self.ignore_packs.iter().copied());
        let index = repo.index();

        if self.unsafe_recovery {
            let ids = index.ids();
            info!(files = ids.len(), "prune: deleting index files");
            for id in &ids {
                cancel.check()?;
                repo.remove_unpacked(FileType::Index, &id.to_hex())?;
            }
        } else if !exclude.is_empty() {
            index.rewrite(
                repo.backend().as_ref(),
                &RewriteOptions {
                    exclude_packs: exclude.clone(),
                    ..RewriteOptions::default()
                },
                cancel,
            )?;
        }

        if !remove.is_empty() {
            info!(packs = remove.len(), "prune: deleting packs");
            delete_packs(repo, &remove, cancel)?;
        }

        if self.unsafe_recovery {
            // The old files are gone already; only write the replacement.
            index.rewrite(
                repo.backend().as_ref(),
                &RewriteOptions {
                    exclude_packs: exclude,
                    skip_deletion: true,
                    ..RewriteOptions::default()
                },
                cancel,
            )?;
        }
        info!(freed = self.stats.freed(), "prune: done");
        Ok(())
    }
}

fn delete_packs(repo: &Repository, packs: &HashSet<PackId>, cancel: &CancelToken) -> Result<()> {
    let mut sorted: Vec<&PackId> = packs.iter().collect();
    sorted.sort();
    for pack in sorted {
        cancel.check()?;
        match repo.remove_pack(pack) {
            Ok(()) => debug!(pack = %pack, "prune: deleted pack"),
            Err(BalerError::NotFound(_)) => warn!(pack = %pack, "prune: pack already gone"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Copy every blob of `keep` found in `packs` into new packs, then flush the
/// repository so the new packs are indexed and the index is persisted.
fn repack(
    repo: &Repository,
    packs: &HashSet<PackId>,
    keep: &HashSet<BlobHandle>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut pending = keep.clone();
    let by_pack = repo.index().each_by_pack(Some(packs));
    for (pack, blobs) in by_pack {
        cancel.check()?;
        let wanted: Vec<_> = blobs
            .iter()
            .filter(|b| pending.contains(&b.handle))
            .collect();
        if wanted.is_empty() {
            continue;
        }
        let bytes = repo.backend().load_all(&pack_handle(&pack))?;
        for b in wanted {
            if !pending.contains(&b.handle) {
                continue;
            }
            let start = b.offset as usize;
            let data = bytes
                .get(start..start + b.length as usize)
                .ok_or_else(|| {
                    BalerError::InvalidFormat(format!(
                        "pack {pack}: blob {} at {}+{} beyond pack end",
                        b.handle, b.offset, b.length
                    ))
                })?;
            let actual = BlobId::compute(data);
            if actual != b.handle.id {
                return Err(BalerError::HashMismatch {
                    what: format!("blob {} in pack {pack}", b.handle),
                    expected: b.handle.id.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            repo.save_blob(b.handle.kind, data, Some(b.handle.id), true)?;
            pending.remove(&b.handle);
        }
        debug!(pack = %pack, "prune: repacked");
    }
    if !pending.is_empty() {
        return Err(BalerError::Other(format!(
            "prune: {} used blobs were not found in the packs being repacked",
            pending.len()
        )));
    }
    repo.flush()
}
