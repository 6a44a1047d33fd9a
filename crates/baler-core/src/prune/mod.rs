//! Space reclamation.
//!
//! [`plan_prune`] classifies every pack as kept, repacked or removed from the
//! set of used blobs and the loaded index. [`PrunePlan::execute`] applies the
//! plan such that new packs and index files exist before old ones go away.

mod execute;
mod plan;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use baler_types::{BalerError, BlobHandle, Result};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{parse_size, PruneConfig, UnusedLimit};
use crate::repo::Repository;

pub use self::plan::{plan_prune, PrunePlan};

/// Maps the bytes still in use to the unused bytes prune may leave behind.
pub type UnusedLimitFn = dyn Fn(u64) -> u64 + Send + Sync;

#[derive(Clone)]
pub struct PruneOptions {
    /// Stop selecting packs for repacking once this many bytes are selected.
    pub max_repack_bytes: u64,
    pub max_unused_bytes: Arc<UnusedLimitFn>,
    /// Only repack packs holding tree blobs.
    pub repack_cacheable_only: bool,
    /// Repack packs below 80% of the target pack size, not just tiny ones.
    pub repack_small: bool,
    /// Never repack; only drop packs without used blobs. The index files are
    /// removed before the packs and rewritten afterwards.
    pub unsafe_recovery: bool,
    /// Small fully used packs are only repacked once there are this many.
    pub small_pack_min_count: usize,
}

impl PruneOptions {
    pub fn from_config(config: &PruneConfig) -> Result<Self> {
        let limit = UnusedLimit::parse(&config.max_unused)?;
        let max_repack_bytes = match &config.max_repack_size {
            Some(s) => parse_size(s)?,
            None => u64::MAX,
        };
        if config.unsafe_recovery && config.repack_cacheable_only {
            return Err(BalerError::Config(
                "unsafe_recovery and repack_cacheable_only cannot be combined".into(),
            ));
        }
        Ok(Self {
            max_repack_bytes,
            max_unused_bytes: Arc::new(move |used| limit.limit(used)),
            repack_cacheable_only: config.repack_cacheable_only,
            repack_small: config.repack_small,
            unsafe_recovery: config.unsafe_recovery,
            small_pack_min_count: config.small_pack_min_count,
        })
    }

    pub fn with_max_unused(mut self, limit: UnusedLimit) -> Self {
        self.max_unused_bytes = Arc::new(move |used| limit.limit(used));
        self
    }
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            max_repack_bytes: u64::MAX,
            max_unused_bytes: Arc::new(|used| UnusedLimit::Percent(5.0).limit(used)),
            repack_cacheable_only: false,
            repack_small: false,
            unsafe_recovery: false,
            small_pack_min_count: PruneConfig::default().small_pack_min_count,
        }
    }
}

impl fmt::Debug for PruneOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PruneOptions")
            .field("max_repack_bytes", &self.max_repack_bytes)
            .field("repack_cacheable_only", &self.repack_cacheable_only)
            .field("repack_small", &self.repack_small)
            .field("unsafe_recovery", &self.unsafe_recovery)
            .field("small_pack_min_count", &self.small_pack_min_count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlobCounts {
    pub used: u64,
    pub duplicate: u64,
    pub unused: u64,
    pub remove: u64,
    pub repack: u64,
    /// Unused blobs dropped while repacking.
    pub repack_remove: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SizeCounts {
    pub used: u64,
    pub duplicate: u64,
    pub unused: u64,
    pub remove: u64,
    pub repack: u64,
    pub repack_remove: u64,
    /// Bytes in packs no index refers to.
    pub unreferenced: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackCounts {
    pub used: u64,
    pub partly_used: u64,
    pub unused: u64,
    pub unreferenced: u64,
    pub keep: u64,
    pub repack: u64,
    pub remove: u64,
}

/// What a prune plan found and will do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub blobs: BlobCounts,
    pub size: SizeCounts,
    pub packs: PackCounts,
}

impl PruneStats {
    /// Unused bytes left once the plan has run.
    pub fn unused_after(&self) -> u64 {
        self.size
            .unused
            .saturating_sub(self.size.remove)
            .saturating_sub(self.size.repack_remove)
    }

    /// Bytes freed by the plan, unreferenced packs included.
    pub fn freed(&self) -> u64 {
        self.size.remove + self.size.repack_remove + self.size.unreferenced
    }

    pub fn log(&self) {
        info!(
            used_blobs = self.blobs.used,
            used_bytes = self.size.used,
            duplicate_blobs = self.blobs.duplicate,
            unused_blobs = self.blobs.unused,
            unused_bytes = self.size.unused,
            unreferenced_bytes = self.size.unreferenced,
            "prune: usage"
        );
        info!(
            keep = self.packs.keep,
            repack = self.packs.repack,
            remove = self.packs.remove,
            unreferenced = self.packs.unreferenced,
            freed = self.freed(),
            unused_after = self.unused_after(),
            "prune: plan"
        );
    }
}

/// Add every blob reachable from a snapshot to `used`.
///
/// Suitable as the usage callback of [`plan_prune`]. Fails if a tree cannot
/// be loaded, since prune must not run on an incomplete view.
pub fn find_used_blobs(
    repo: &Repository,
    used: &mut HashSet<BlobHandle>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut pending = Vec::new();
    for id in repo.list_snapshots()? {
        cancel.check()?;
        if let Some(tree) = repo.load_snapshot(&id)?.tree {
            pending.push(tree);
        }
    }
    let mut trees = 0usize;
    while let Some(id) = pending.pop() {
        cancel.check()?;
        if !used.insert(BlobHandle::tree(id)) {
            continue;
        }
        trees += 1;
        let tree = repo.load_tree(&id)?;
        for node in &tree.nodes {
            for blob in node.content.iter().flatten() {
                used.insert(BlobHandle::data(*blob));
            }
            if let Some(sub) = node.subtree {
                pending.push(sub);
            }
        }
    }
    debug!(trees, blobs = used.len(), "prune: collected used blobs");
    Ok(())
}
