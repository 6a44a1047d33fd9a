use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use baler_storage::{Backend, FileType, Handle};
use baler_types::{BalerError, BlobHandle, IndexId, PackId, Result};
use tracing::{debug, info};

use super::file::save_index;
use super::{mixed_packs_in, Index, PackedBlob};
use crate::cancel::CancelToken;
use crate::config::IndexConfig;
use crate::repo::pack::PackEntry;

/// Layered view over one in-progress index and any number of finalized ones.
///
/// Lookups consult the in-progress index first, then the finalized set.
/// When both locks are needed, `in_progress` is always taken first.
pub struct MasterIndex {
    in_progress: RwLock<Arc<Index>>,
    finalized: RwLock<Vec<Arc<Index>>>,
    config: IndexConfig,
}

/// Controls for [`MasterIndex::rewrite`].
#[derive(Debug, Default, Clone)]
pub struct RewriteOptions {
    /// Entries in these packs are left out of the new files.
    pub exclude_packs: HashSet<PackId>,
    /// Index files to delete in addition to the ones currently loaded.
    pub extra_obsolete: Vec<IndexId>,
    /// Write the new files but leave obsolete ones in place.
    pub skip_deletion: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RewriteStats {
    pub written: Vec<IndexId>,
    pub removed: Vec<IndexId>,
    pub entries: usize,
}

impl MasterIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            in_progress: RwLock::new(Arc::new(Index::new(config))),
            finalized: RwLock::new(Vec::new()),
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn current(&self) -> Arc<Index> {
        Arc::clone(&self.in_progress.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn finalized_read(&self) -> RwLockReadGuard<'_, Vec<Arc<Index>>> {
        self.finalized.read().unwrap_or_else(|p| p.into_inner())
    }

    fn finalized_write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Index>>> {
        self.finalized.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Add an index loaded from the backend.
    pub fn insert(&self, index: Index) -> Result<()> {
        if !index.is_finalized() {
            return Err(BalerError::IndexNotFinalized);
        }
        self.finalized_write().push(Arc::new(index));
        Ok(())
    }

    /// Record a freshly written pack in the in-progress index.
    pub fn store_pack(&self, pack_id: PackId, blobs: &[PackEntry]) -> Result<()> {
        self.current().store_pack(pack_id, blobs)
    }

    /// Every known location of a blob, in-progress entries first.
    pub fn lookup(&self, handle: &BlobHandle) -> Vec<PackedBlob> {
        let mut out = self.current().lookup(handle);
        for idx in self.finalized_read().iter() {
            out.extend(idx.lookup(handle));
        }
        out
    }

    pub fn has(&self, handle: &BlobHandle) -> bool {
        if self.current().has(handle) {
            return true;
        }
        self.finalized_read().iter().any(|idx| idx.has(handle))
    }

    pub fn lookup_size(&self, handle: &BlobHandle) -> Option<u32> {
        if let Some(size) = self.current().lookup_size(handle) {
            return Some(size);
        }
        self.finalized_read()
            .iter()
            .find_map(|idx| idx.lookup_size(handle))
    }

    /// Total entries across all layers, duplicates included.
    pub fn len(&self) -> usize {
        self.current().len() + self.finalized_read().iter().map(|i| i.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of finalized indexes held in memory.
    pub fn finalized_count(&self) -> usize {
        self.finalized_read().len()
    }

    /// IDs of every persisted index file this view was built from.
    pub fn ids(&self) -> BTreeSet<IndexId> {
        self.finalized_read()
            .iter()
            .flat_map(|idx| idx.ids())
            .collect()
    }

    pub fn packs(&self) -> BTreeSet<PackId> {
        let mut packs: BTreeSet<PackId> = self.current().packs().into_iter().collect();
        for idx in self.finalized_read().iter() {
            packs.extend(idx.packs());
        }
        packs
    }

    /// Visit every entry of every layer.
    pub fn each(&self, mut f: impl FnMut(PackedBlob)) {
        let current = self.current();
        current.each(&mut f);
        let finalized: Vec<Arc<Index>> = self.finalized_read().clone();
        for idx in finalized {
            idx.each(&mut f);
        }
    }

    /// Packs holding both data and tree blobs in any layer.
    pub fn mixed_packs(&self) -> Vec<PackId> {
        mixed_packs_in(|f| self.each(f))
    }

    /// Entries grouped by pack, packs ascending and blobs by offset. Copies of
    /// the same blob at the same offset, as seen when two index files list
    /// one pack, are reported once.
    pub fn each_by_pack(
        &self,
        only: Option<&HashSet<PackId>>,
    ) -> BTreeMap<PackId, Vec<PackedBlob>> {
        let mut layers = vec![self.current()];
        layers.extend(self.finalized_read().iter().cloned());
        group_by_pack(&layers, only)
    }

    /// Finalize the in-progress index, move it to the finalized set and start
    /// a new one. Returns the finalized index, or `None` if it was empty.
    pub fn finalize_in_progress(&self) -> Option<Arc<Index>> {
        let mut slot = self.in_progress.write().unwrap_or_else(|p| p.into_inner());
        if slot.is_empty() {
            return None;
        }
        let done = std::mem::replace(&mut *slot, Arc::new(Index::new(&self.config)));
        done.finalize();
        self.finalized_write().push(Arc::clone(&done));
        Some(done)
    }

    /// Persist the in-progress index if it is full.
    pub fn save_full(&self, backend: &dyn Backend) -> Result<Vec<IndexId>> {
        if !self.current().is_full() {
            return Ok(Vec::new());
        }
        self.flush(backend)
    }

    /// Finalize the in-progress index and persist every finalized index that
    /// has not been written yet.
    pub fn flush(&self, backend: &dyn Backend) -> Result<Vec<IndexId>> {
        self.finalize_in_progress();
        let unsaved: Vec<Arc<Index>> = self
            .finalized_read()
            .iter()
            .filter(|idx| idx.ids().is_empty())
            .cloned()
            .collect();
        let mut saved = Vec::with_capacity(unsaved.len());
        for idx in unsaved {
            saved.push(save_index(backend, &idx)?);
        }
        Ok(saved)
    }

    /// Fold all persisted finalized indexes into one, in memory. Entries are
    /// preserved exactly; the merged index carries every source ID.
    pub fn merge_final_indexes(&self) -> Result<()> {
        let mut finalized = self.finalized_write();
        let (persisted, pending): (Vec<_>, Vec<_>) =
            finalized.drain(..).partition(|idx| !idx.ids().is_empty());
        if persisted.len() <= 1 {
            finalized.extend(persisted);
            finalized.extend(pending);
            return Ok(());
        }
        let merged = Index::new(&self.config);
        merged.finalize();
        for idx in &persisted {
            if let Err(e) = merged.merge(idx) {
                finalized.extend(persisted);
                finalized.extend(pending);
                return Err(e);
            }
        }
        debug!(
            sources = persisted.len(),
            entries = merged.len(),
            "merged finalized indexes"
        );
        finalized.push(Arc::new(merged));
        finalized.extend(pending);
        Ok(())
    }

    /// Replace all finalized indexes with freshly written files.
    ///
    /// New files are saved first and list the replaced IDs as superseded. Only
    /// after they are durable does the in-memory set switch over, and only
    /// then are the obsolete files deleted.
    pub fn rewrite(
        &self,
        backend: &dyn Backend,
        options: &RewriteOptions,
        cancel: &CancelToken,
    ) -> Result<RewriteStats> {
        let current: Vec<Arc<Index>> = self.finalized_read().clone();
        let mut obsolete: BTreeSet<IndexId> =
            current.iter().flat_map(|idx| idx.ids()).collect();
        obsolete.extend(options.extra_obsolete.iter().copied());
        let supersedes: Vec<IndexId> = obsolete.iter().copied().collect();

        let max_blobs = self.config.max_blobs_per_file;
        let mut fresh: Vec<Arc<Index>> = Vec::new();
        let mut building = Index::new(&self.config);
        building.add_to_supersedes(&supersedes)?;
        let mut entries = 0;
        for (pack_id, blobs) in group_by_pack(&current, None) {
            cancel.check()?;
            if options.exclude_packs.contains(&pack_id) {
                continue;
            }
            if !building.is_empty() && building.len() + blobs.len() > max_blobs {
                building.finalize();
                fresh.push(Arc::new(building));
                building = Index::new(&self.config);
                building.add_to_supersedes(&supersedes)?;
            }
            entries += blobs.len();
            building.store_packed(pack_id, &blobs)?;
        }
        if !building.is_empty() {
            building.finalize();
            fresh.push(Arc::new(building));
        }

        let mut stats = RewriteStats {
            entries,
            ..RewriteStats::default()
        };
        for idx in &fresh {
            cancel.check()?;
            stats.written.push(save_index(backend, idx)?);
        }

        {
            let mut finalized = self.finalized_write();
            finalized.retain(|idx| !current.iter().any(|old| Arc::ptr_eq(old, idx)));
            let added_later = std::mem::take(&mut *finalized);
            finalized.extend(fresh);
            finalized.extend(added_later);
        }

        if !options.skip_deletion {
            for id in obsolete {
                if stats.written.contains(&id) {
                    continue;
                }
                backend.remove(&Handle::new(FileType::Index, id.to_hex()))?;
                stats.removed.push(id);
            }
        }
        info!(
            written = stats.written.len(),
            removed = stats.removed.len(),
            entries = stats.entries,
            "rewrote index"
        );
        Ok(stats)
    }
}

fn group_by_pack(
    layers: &[Arc<Index>],
    only: Option<&HashSet<PackId>>,
) -> BTreeMap<PackId, Vec<PackedBlob>> {
    let mut by_pack: BTreeMap<PackId, Vec<PackedBlob>> = BTreeMap::new();
    for idx in layers {
        for (pack_id, blobs) in idx.pack_blobs() {
            if only.is_some_and(|set| !set.contains(&pack_id)) {
                continue;
            }
            by_pack.entry(pack_id).or_default().extend(blobs);
        }
    }
    for blobs in by_pack.values_mut() {
        blobs.sort_by_key(|b| (b.offset, b.handle));
        blobs.dedup_by_key(|b| (b.offset, b.handle));
    }
    by_pack.retain(|_, blobs| !blobs.is_empty());
    by_pack
}

#[cfg(test)]
mod tests {
    use super::*;
    use baler_types::{BlobId, BlobKind};

    fn entry(offset: u32) -> PackEntry {
        PackEntry {
            kind: BlobKind::Data,
            id: BlobId::random(),
            offset,
            length: 10,
            uncompressed_length: 0,
        }
    }

    #[test]
    fn lookup_sees_in_progress_and_finalized() {
        let mi = MasterIndex::new(&IndexConfig::default());
        let a = entry(0);
        let b = entry(0);
        mi.store_pack(PackId::random(), &[a]).unwrap();
        mi.finalize_in_progress().unwrap();
        mi.store_pack(PackId::random(), &[b]).unwrap();
        assert!(mi.has(&BlobHandle::data(a.id)));
        assert!(mi.has(&BlobHandle::data(b.id)));
        assert_eq!(mi.finalized_count(), 1);
        assert_eq!(mi.len(), 2);
    }

    #[test]
    fn mixed_pack_split_across_layers() {
        let mi = MasterIndex::new(&IndexConfig::default());
        let pack = PackId::random();
        let tree = PackEntry {
            kind: BlobKind::Tree,
            ..entry(20)
        };
        mi.store_pack(pack, &[entry(0)]).unwrap();
        mi.store_pack(PackId::random(), &[entry(0)]).unwrap();
        mi.finalize_in_progress().unwrap();
        assert!(mi.mixed_packs().is_empty());
        mi.store_pack(pack, &[tree]).unwrap();
        assert_eq!(mi.mixed_packs(), vec![pack]);
    }

    #[test]
    fn finalize_empty_is_noop() {
        let mi = MasterIndex::new(&IndexConfig::default());
        assert!(mi.finalize_in_progress().is_none());
        assert_eq!(mi.finalized_count(), 0);
    }

    #[test]
    fn insert_rejects_unfinalized() {
        let mi = MasterIndex::new(&IndexConfig::default());
        assert!(mi.insert(Index::default()).is_err());
    }

    #[test]
    fn group_by_pack_dedups_shared_pack() {
        let pack = PackId::random();
        let e = entry(9);
        let a = Index::default();
        a.store_pack(pack, &[e]).unwrap();
        let b = Index::default();
        b.store_pack(pack, &[e]).unwrap();
        let groups = group_by_pack(&[Arc::new(a), Arc::new(b)], None);
        assert_eq!(groups[&pack].len(), 1);
    }
}
