use baler_types::BlobId;

use super::arena::Arena;
use crate::config::IndexConfig;

/// One stored blob location. `pack_index` refers to the owning index's pack list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: BlobId,
    pub pack_index: u32,
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
    next: u32,
}

/// Sizing knobs for [`IndexMap`].
#[derive(Debug, Clone, Copy)]
pub struct IndexMapConfig {
    pub initial_buckets: usize,
    pub max_load: usize,
    pub arena_block_entries: usize,
}

impl Default for IndexMapConfig {
    fn default() -> Self {
        IndexMapConfig::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for IndexMapConfig {
    fn from(c: &IndexConfig) -> Self {
        Self {
            initial_buckets: c.initial_buckets.max(1).next_power_of_two(),
            max_load: c.max_load.max(1),
            arena_block_entries: c.arena_block_entries,
        }
    }
}

/// Hash map from blob ID to pack locations with stable entry references.
///
/// Entries are chained through `u32` arena indices. Slot 0 of the arena is a
/// reserved sentinel so a zero link means "end of chain". New entries go to
/// the tail of their chain, so lookups see the earliest insertion first and
/// duplicates are visited in insertion order.
///
/// Not internally synchronized: callers guard writers with a lock.
pub struct IndexMap {
    buckets: Vec<u32>,
    arena: Arena<IndexEntry>,
    len: usize,
    config: IndexMapConfig,
}

impl IndexMap {
    pub fn new() -> Self {
        Self::with_config(IndexMapConfig::default())
    }

    pub fn with_config(config: IndexMapConfig) -> Self {
        Self {
            buckets: Vec::new(),
            arena: Arena::new(config.arena_block_entries),
            len: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a location. Existing entries for `id` are kept. Returns the
    /// stable reference of the new entry.
    pub fn add(
        &mut self,
        id: BlobId,
        pack_index: u32,
        offset: u32,
        length: u32,
        uncompressed_length: u32,
    ) -> usize {
        if self.buckets.is_empty() {
            self.buckets = vec![0; self.config.initial_buckets];
            // Reserve the sentinel slot.
            self.arena.alloc();
        }
        if self.len >= self.config.max_load * self.buckets.len() {
            self.grow();
        }

        let (idx, entry) = self.arena.alloc();
        *entry = IndexEntry {
            id,
            pack_index,
            offset,
            length,
            uncompressed_length,
            next: 0,
        };
        let link = to_link(idx);
        let bucket = self.bucket_of(&id);
        self.append_to_chain(bucket, link);
        self.len += 1;
        idx
    }

    /// First inserted entry for `id`.
    pub fn get(&self, id: &BlobId) -> Option<&IndexEntry> {
        self.first_index(id).map(|idx| self.arena.get(idx))
    }

    /// Stable reference of the first inserted entry for `id`.
    pub fn first_index(&self, id: &BlobId) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut link = self.buckets[self.bucket_of(id)];
        while link != 0 {
            let entry = self.arena.get(link as usize);
            if entry.id == *id {
                return Some(link as usize);
            }
            link = entry.next;
        }
        None
    }

    /// Resolve a reference returned by [`IndexMap::add`] or [`IndexMap::first_index`].
    pub fn entry(&self, idx: usize) -> &IndexEntry {
        self.arena.get(idx)
    }

    /// Visit every entry for `id` in insertion order.
    pub fn for_each_with_id(&self, id: &BlobId, mut f: impl FnMut(&IndexEntry)) {
        if self.buckets.is_empty() {
            return;
        }
        let mut link = self.buckets[self.bucket_of(id)];
        while link != 0 {
            let entry = self.arena.get(link as usize);
            if entry.id == *id {
                f(entry);
            }
            link = entry.next;
        }
    }

    /// Visit all entries in insertion order until `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&IndexEntry) -> bool) {
        for idx in 1..=self.len {
            if !f(self.arena.get(idx)) {
                return;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> + '_ {
        (1..=self.len).map(move |idx| self.arena.get(idx))
    }

    fn bucket_of(&self, id: &BlobId) -> usize {
        (id.low_bits() as usize) & (self.buckets.len() - 1)
    }

    fn append_to_chain(&mut self, bucket: usize, link: u32) {
        let mut tail = self.buckets[bucket];
        if tail == 0 {
            self.buckets[bucket] = link;
            return;
        }
        loop {
            let next = self.arena.get(tail as usize).next;
            if next == 0 {
                break;
            }
            tail = next;
        }
        self.arena.get_mut(tail as usize).next = link;
    }

    /// Double the bucket array and rebuild the chains in arena order.
    fn grow(&mut self) {
        let size = self.buckets.len() * 2;
        self.buckets = vec![0; size];
        let mut tails = vec![0u32; size];
        for idx in 1..=self.len {
            let bucket = self.bucket_of(&self.arena.get(idx).id);
            let link = to_link(idx);
            self.arena.get_mut(idx).next = 0;
            match tails[bucket] {
                0 => self.buckets[bucket] = link,
                tail => self.arena.get_mut(tail as usize).next = link,
            }
            tails[bucket] = link;
        }
    }
}

impl Default for IndexMap {
    fn default() -> Self {
        Self::new()
    }
}

// Chain links are 32-bit; an index map holds at most u32::MAX entries.
fn to_link(idx: usize) -> u32 {
    debug_assert!(idx <= u32::MAX as usize);
    idx as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> IndexMap {
        IndexMap::with_config(IndexMapConfig {
            initial_buckets: 2,
            max_load: 2,
            arena_block_entries: 2,
        })
    }

    #[test]
    fn empty_map_finds_nothing() {
        let m = IndexMap::new();
        assert!(m.get(&BlobId::random()).is_none());
        assert!(m.first_index(&BlobId::random()).is_none());
        assert_eq!(m.iter().count(), 0);
    }

    #[test]
    fn first_reference_is_one() {
        let mut m = IndexMap::new();
        let id = BlobId::random();
        assert_eq!(m.add(id, 0, 0, 1, 0), 1);
        assert_eq!(m.first_index(&id), Some(1));
    }

    #[test]
    fn chains_stay_ordered_across_growth() {
        let mut m = small();
        let dup = BlobId::random();
        m.add(dup, 0, 0, 10, 0);
        for i in 0..50 {
            m.add(BlobId::random(), 0, i, 1, 0);
        }
        m.add(dup, 1, 5, 10, 0);
        assert!(m.buckets.len() > 2);
        let mut packs = Vec::new();
        m.for_each_with_id(&dup, |e| packs.push(e.pack_index));
        assert_eq!(packs, vec![0, 1]);
        assert_eq!(m.get(&dup).unwrap().pack_index, 0);
    }
}
