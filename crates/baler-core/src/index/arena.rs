//! Append-only entry storage whose elements never move.
//!
//! Entries live in blocks whose sizes double: with a first block of `B`
//! entries, block `k` holds `B << k` entries and starts at index
//! `B * (2^k - 1)`. Growing only pushes a new block, so a reference obtained
//! for an entry stays valid for the life of the arena.

pub(crate) struct Arena<T> {
    blocks: Vec<Box<[T]>>,
    len: usize,
    shift: u32,
}

impl<T: Default> Arena<T> {
    /// `first_block` is rounded up to a power of two.
    pub fn new(first_block: usize) -> Self {
        let first_block = first_block.max(1).next_power_of_two();
        Self {
            blocks: Vec::new(),
            len: 0,
            shift: first_block.trailing_zeros(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    /// Block number and offset within the block for `idx`.
    fn locate(&self, idx: usize) -> (usize, usize) {
        let q = (idx >> self.shift) + 1;
        let block = (usize::BITS - 1 - q.leading_zeros()) as usize;
        let start = ((1usize << block) - 1) << self.shift;
        (block, idx - start)
    }

    /// Append a default entry and return its index with a handle to fill it in.
    pub fn alloc(&mut self) -> (usize, &mut T) {
        let idx = self.len;
        let (block, offset) = self.locate(idx);
        if block == self.blocks.len() {
            let size = 1usize << (self.shift as usize + block);
            self.blocks
                .push((0..size).map(|_| T::default()).collect::<Vec<_>>().into_boxed_slice());
        }
        self.len += 1;
        (idx, &mut self.blocks[block][offset])
    }

    pub fn get(&self, idx: usize) -> &T {
        debug_assert!(idx < self.len, "arena index {idx} out of bounds");
        let (block, offset) = self.locate(idx);
        &self.blocks[block][offset]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut T {
        debug_assert!(idx < self.len, "arena index {idx} out of bounds");
        let (block, offset) = self.locate(idx);
        &mut self.blocks[block][offset]
    }
}
