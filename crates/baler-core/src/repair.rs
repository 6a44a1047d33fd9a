//! Rebuilding the index from the packs in the backend.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use baler_types::{BalerError, IndexId, PackId, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::index::file::{for_all_indexes, list_index_ids};
use crate::index::{Index, MasterIndex, PackedBlob, RewriteOptions};
use crate::repo::pack::{expected_pack_size, read_pack_header, PackEntry};
use crate::repo::Repository;

#[derive(Debug, Default, Clone)]
pub struct RepairIndexOptions {
    /// Ignore existing index files and read the header of every pack.
    pub read_all_packs: bool,
}

#[derive(Debug, Default, Clone)]
pub struct RepairStats {
    /// Packs whose existing index entries were reused.
    pub packs_trusted: usize,
    /// Packs whose header was read.
    pub packs_read: usize,
    /// Packs whose header could not be read; they stay out of the index.
    pub packs_invalid: Vec<PackId>,
    /// Indexed packs no longer present in the backend.
    pub packs_dropped: Vec<PackId>,
    pub indexes_written: Vec<IndexId>,
    pub indexes_removed: Vec<IndexId>,
}

/// Build a new index from trusted index entries plus pack headers, persist
/// it and delete every previous index file.
///
/// An index entry set is trusted when its index file loads cleanly and the
/// pack's size in the backend matches the size the entries imply. All other
/// packs in the backend have their header read.
pub fn repair_index(
    repo: &Arc<Repository>,
    opts: &RepairIndexOptions,
    cancel: &CancelToken,
) -> Result<RepairStats> {
    let backend = repo.backend().as_ref();
    let config = repo.index_config().clone();
    let old_ids = list_index_ids(backend)?;
    let mut stats = RepairStats::default();

    let mut indexed: BTreeMap<PackId, Vec<PackedBlob>> = BTreeMap::new();
    if !opts.read_all_packs {
        let loaded = MasterIndex::new(&config);
        for_all_indexes(backend, &config, cancel, |id, res| {
            match res {
                Ok(index) => loaded.insert(index)?,
                Err(e) => warn!(index = %id, error = %e, "repair: ignoring unreadable index"),
            }
            Ok(())
        })?;
        indexed = loaded.each_by_pack(None);
    }

    let listed = repo.list_packs()?;
    let mut trusted: Vec<(PackId, Vec<PackedBlob>)> = Vec::new();
    let mut to_read: Vec<(PackId, u64)> = Vec::new();
    for (pack, size) in listed {
        match indexed.remove(&pack) {
            Some(blobs) if implied_size(&blobs) == Some(size) => trusted.push((pack, blobs)),
            Some(_) => {
                debug!(pack = %pack, "repair: size disagrees with index");
                to_read.push((pack, size));
            }
            None => to_read.push((pack, size)),
        }
    }
    stats.packs_dropped = indexed.into_keys().collect();
    for pack in &stats.packs_dropped {
        warn!(pack = %pack, "repair: dropping missing pack from index");
    }
    stats.packs_trusted = trusted.len();

    info!(
        trusted = trusted.len(),
        to_read = to_read.len(),
        "repair: reading pack headers"
    );
    let headers: Mutex<Vec<(PackId, Vec<PackEntry>)>> = Mutex::new(Vec::new());
    let invalid: Mutex<Vec<PackId>> = Mutex::new(Vec::new());
    to_read.par_iter().try_for_each(|(pack, size)| {
        cancel.check()?;
        match read_pack_header(backend, pack, *size) {
            Ok(entries) => headers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((*pack, entries)),
            Err(e) => {
                warn!(pack = %pack, error = %e, "repair: cannot read pack header");
                invalid
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(*pack);
            }
        }
        Ok::<(), BalerError>(())
    })?;
    let mut headers = headers.into_inner().unwrap_or_else(|p| p.into_inner());
    headers.sort_by_key(|(pack, _)| *pack);
    stats.packs_read = headers.len();
    stats.packs_invalid = invalid.into_inner().unwrap_or_else(|p| p.into_inner());
    stats.packs_invalid.sort();

    let rebuilt = Index::new(&config);
    for (pack, blobs) in &trusted {
        rebuilt.store_packed(*pack, blobs)?;
    }
    for (pack, entries) in &headers {
        rebuilt.store_pack(*pack, entries)?;
    }
    rebuilt.finalize();

    let fresh = MasterIndex::new(&config);
    fresh.insert(rebuilt)?;
    let rewritten = fresh.rewrite(
        backend,
        &RewriteOptions {
            extra_obsolete: old_ids,
            ..RewriteOptions::default()
        },
        cancel,
    )?;
    stats.indexes_written = rewritten.written;
    stats.indexes_removed = rewritten.removed;
    repo.set_index(Arc::new(fresh));

    info!(
        written = stats.indexes_written.len(),
        removed = stats.indexes_removed.len(),
        read = stats.packs_read,
        invalid = stats.packs_invalid.len(),
        dropped = stats.packs_dropped.len(),
        "repair: index rebuilt"
    );
    Ok(stats)
}

fn implied_size(blobs: &[PackedBlob]) -> Option<u64> {
    let entries: Vec<PackEntry> = blobs.iter().map(PackedBlob::to_entry).collect();
    expected_pack_size(&entries).ok()
}
