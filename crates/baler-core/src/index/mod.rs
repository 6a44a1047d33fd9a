mod arena;
pub mod file;
pub mod map;
pub mod master;

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use baler_types::{BalerError, BlobHandle, BlobKind, IndexId, PackId, Result};

use crate::config::IndexConfig;
use crate::repo::pack::PackEntry;

pub use map::{IndexEntry, IndexMap, IndexMapConfig};
pub use master::{MasterIndex, RewriteOptions, RewriteStats};

/// A blob location as answered by index lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedBlob {
    pub handle: BlobHandle,
    pub pack_id: PackId,
    pub offset: u32,
    pub length: u32,
    /// 0 when the stored bytes are the plaintext.
    pub uncompressed_length: u32,
}

impl PackedBlob {
    pub fn is_compressed(&self) -> bool {
        self.uncompressed_length != 0
    }

    /// Size of the blob's plaintext.
    pub fn plaintext_length(&self) -> u32 {
        if self.is_compressed() {
            self.uncompressed_length
        } else {
            self.length
        }
    }

    /// The pack header entry describing this location.
    pub fn to_entry(&self) -> PackEntry {
        PackEntry {
            kind: self.handle.kind,
            id: self.handle.id,
            offset: self.offset,
            length: self.length,
            uncompressed_length: self.uncompressed_length,
        }
    }
}

/// One generation of blob-location mappings.
///
/// While in progress an index accepts new packs; after [`Index::finalize`] it
/// is immutable and can be persisted, which gives it an ID. Lookups take a
/// shared lock, so any number of readers run alongside a single writer.
pub struct Index {
    state: RwLock<IndexState>,
}

struct IndexState {
    by_kind: [IndexMap; 2],
    packs: Vec<PackId>,
    finalized: bool,
    ids: Vec<IndexId>,
    supersedes: Vec<IndexId>,
    created: Instant,
    max_blobs: usize,
    full_age: Duration,
}

impl IndexState {
    fn len(&self) -> usize {
        self.by_kind.iter().map(IndexMap::len).sum()
    }

    fn packed(&self, kind: BlobKind, e: &IndexEntry) -> PackedBlob {
        PackedBlob {
            handle: BlobHandle::new(e.id, kind),
            pack_id: self.packs[e.pack_index as usize],
            offset: e.offset,
            length: e.length,
            uncompressed_length: e.uncompressed_length,
        }
    }

    fn add_pack(&mut self, pack_id: PackId) -> u32 {
        self.packs.push(pack_id);
        (self.packs.len() - 1) as u32
    }
}

impl Index {
    pub fn new(config: &IndexConfig) -> Self {
        let map_config = IndexMapConfig::from(config);
        Self {
            state: RwLock::new(IndexState {
                by_kind: [
                    IndexMap::with_config(map_config),
                    IndexMap::with_config(map_config),
                ],
                packs: Vec::new(),
                finalized: false,
                ids: Vec::new(),
                supersedes: Vec::new(),
                created: Instant::now(),
                max_blobs: config.max_blobs_per_file,
                full_age: Duration::from_secs(config.full_age_secs),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Record every blob of a freshly written pack.
    pub fn store_pack(&self, pack_id: PackId, blobs: &[PackEntry]) -> Result<()> {
        let mut state = self.write();
        if state.finalized {
            return Err(BalerError::IndexFinalized);
        }
        let pack_index = state.add_pack(pack_id);
        for b in blobs {
            state.by_kind[b.kind.slot()].add(
                b.id,
                pack_index,
                b.offset,
                b.length,
                b.uncompressed_length,
            );
        }
        Ok(())
    }

    /// Record already-indexed locations of one pack, e.g. while rewriting.
    pub(crate) fn store_packed(&self, pack_id: PackId, blobs: &[PackedBlob]) -> Result<()> {
        let mut state = self.write();
        if state.finalized {
            return Err(BalerError::IndexFinalized);
        }
        let pack_index = state.add_pack(pack_id);
        for b in blobs {
            state.by_kind[b.handle.kind.slot()].add(
                b.handle.id,
                pack_index,
                b.offset,
                b.length,
                b.uncompressed_length,
            );
        }
        Ok(())
    }

    /// All stored locations of a blob, earliest insertion first.
    pub fn lookup(&self, handle: &BlobHandle) -> Vec<PackedBlob> {
        let state = self.read();
        let mut out = Vec::new();
        state.by_kind[handle.kind.slot()]
            .for_each_with_id(&handle.id, |e| out.push(state.packed(handle.kind, e)));
        out
    }

    pub fn has(&self, handle: &BlobHandle) -> bool {
        self.read().by_kind[handle.kind.slot()]
            .get(&handle.id)
            .is_some()
    }

    /// Plaintext size of the first stored copy.
    pub fn lookup_size(&self, handle: &BlobHandle) -> Option<u32> {
        let state = self.read();
        state.by_kind[handle.kind.slot()]
            .get(&handle.id)
            .map(|e| state.packed(handle.kind, e).plaintext_length())
    }

    /// Visit every entry. Holds the read lock; `f` must not write to this index.
    pub fn each(&self, mut f: impl FnMut(PackedBlob)) {
        let state = self.read();
        for kind in BlobKind::ALL {
            for e in state.by_kind[kind.slot()].iter() {
                f(state.packed(kind, e));
            }
        }
    }

    /// Entries grouped by pack, in the order packs were stored.
    pub fn pack_blobs(&self) -> Vec<(PackId, Vec<PackedBlob>)> {
        let state = self.read();
        let mut groups: Vec<Vec<PackedBlob>> = vec![Vec::new(); state.packs.len()];
        for kind in BlobKind::ALL {
            for e in state.by_kind[kind.slot()].iter() {
                groups[e.pack_index as usize].push(state.packed(kind, e));
            }
        }
        state.packs.iter().copied().zip(groups).collect()
    }

    /// Distinct pack IDs, in first-stored order.
    pub fn packs(&self) -> Vec<PackId> {
        let state = self.read();
        let mut seen = HashMap::new();
        for p in &state.packs {
            let next = seen.len();
            seen.entry(*p).or_insert(next);
        }
        let mut out: Vec<(PackId, usize)> = seen.into_iter().collect();
        out.sort_by_key(|(_, pos)| *pos);
        out.into_iter().map(|(p, _)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An index is full once it reaches the per-file blob limit, or once a
    /// non-empty index has been open longer than the configured age.
    pub fn is_full(&self) -> bool {
        let state = self.read();
        let blobs = state.len();
        blobs >= state.max_blobs || (blobs > 0 && state.created.elapsed() >= state.full_age)
    }

    pub fn is_finalized(&self) -> bool {
        self.read().finalized
    }

    /// Freeze the index. Idempotent.
    pub fn finalize(&self) {
        self.write().finalized = true;
    }

    /// Attach the ID of the persisted file. Only valid once, on a finalized index.
    pub fn set_id(&self, id: IndexId) -> Result<()> {
        let mut state = self.write();
        if !state.finalized {
            return Err(BalerError::IndexNotFinalized);
        }
        if !state.ids.is_empty() {
            return Err(BalerError::Other(format!(
                "index already has id {}",
                state.ids[0]
            )));
        }
        state.ids.push(id);
        Ok(())
    }

    /// The single ID of an unmerged, persisted index.
    pub fn id(&self) -> Result<IndexId> {
        let state = self.read();
        match state.ids.as_slice() {
            [id] => Ok(*id),
            [] => Err(BalerError::IndexWithoutId),
            ids => Err(BalerError::Other(format!(
                "index was merged from {} files",
                ids.len()
            ))),
        }
    }

    /// IDs of every persisted file merged into this index.
    pub fn ids(&self) -> Vec<IndexId> {
        self.read().ids.clone()
    }

    pub fn supersedes(&self) -> Vec<IndexId> {
        self.read().supersedes.clone()
    }

    pub fn add_to_supersedes(&self, ids: &[IndexId]) -> Result<()> {
        let mut state = self.write();
        if state.finalized {
            return Err(BalerError::IndexFinalized);
        }
        state.supersedes.extend_from_slice(ids);
        Ok(())
    }

    /// Fold a finalized index into this finalized one. Every entry of `other`
    /// is kept as is, duplicates included.
    pub fn merge(&self, other: &Index) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Err(BalerError::Other("cannot merge an index into itself".into()));
        }
        let mut state = self.write();
        let theirs = other.read();
        if !state.finalized || !theirs.finalized {
            return Err(BalerError::IndexNotFinalized);
        }
        let base = state.packs.len() as u32;
        state.packs.extend_from_slice(&theirs.packs);
        for kind in BlobKind::ALL {
            let target = &mut state.by_kind[kind.slot()];
            for e in theirs.by_kind[kind.slot()].iter() {
                target.add(
                    e.id,
                    base + e.pack_index,
                    e.offset,
                    e.length,
                    e.uncompressed_length,
                );
            }
        }
        state.ids.extend_from_slice(&theirs.ids);
        state.supersedes.extend_from_slice(&theirs.supersedes);
        Ok(())
    }

    /// Packs holding both data and tree blobs.
    pub fn mixed_packs(&self) -> Vec<PackId> {
        mixed_packs_in(|f| self.each(f))
    }
}

/// Sorted IDs of packs that `visit` reports with both blob kinds.
pub(crate) fn mixed_packs_in(visit: impl FnOnce(&mut dyn FnMut(PackedBlob))) -> Vec<PackId> {
    let mut kinds: HashMap<PackId, [bool; 2]> = HashMap::new();
    visit(&mut |pb: PackedBlob| {
        kinds.entry(pb.pack_id).or_default()[pb.handle.kind.slot()] = true;
    });
    let mut mixed: Vec<PackId> = kinds
        .into_iter()
        .filter(|(_, k)| k[0] && k[1])
        .map(|(p, _)| p)
        .collect();
    mixed.sort();
    mixed
}

impl Default for Index {
    fn default() -> Self {
        Self::new(&IndexConfig::default())
    }
}
