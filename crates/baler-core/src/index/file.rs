//! On-disk index files.
//!
//! An index file is a msgpack document listing, per pack, the blobs it holds.
//! Its name is the hex BLAKE2b-256 of its bytes, so every load can be verified.

use std::collections::HashMap;

use baler_storage::{Backend, FileType, Handle};
use baler_types::{BalerError, BlobId, BlobKind, IndexId, PackId, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Index;
use crate::cancel::CancelToken;
use crate::config::IndexConfig;

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    #[serde(default)]
    pub supersedes: Vec<IndexId>,
    pub packs: Vec<PackRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PackRecord {
    pub id: PackId,
    pub blobs: Vec<BlobRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub id: BlobId,
    pub kind: BlobKind,
    pub offset: u32,
    pub length: u32,
    #[serde(default)]
    pub uncompressed_length: u32,
}

impl Index {
    /// Serialize the index. Packs keep first-stored order and blobs are sorted
    /// by offset, so equal contents give equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let state = self.read();
        let mut groups: Vec<Vec<BlobRecord>> = vec![Vec::new(); state.packs.len()];
        for kind in BlobKind::ALL {
            for e in state.by_kind[kind.slot()].iter() {
                groups[e.pack_index as usize].push(BlobRecord {
                    id: e.id,
                    kind,
                    offset: e.offset,
                    length: e.length,
                    uncompressed_length: e.uncompressed_length,
                });
            }
        }

        let mut packs: Vec<PackRecord> = Vec::new();
        let mut position: HashMap<PackId, usize> = HashMap::new();
        for (pack_index, blobs) in groups.into_iter().enumerate() {
            if blobs.is_empty() {
                continue;
            }
            let pack_id = state.packs[pack_index];
            match position.get(&pack_id) {
                Some(&i) => packs[i].blobs.extend(blobs),
                None => {
                    position.insert(pack_id, packs.len());
                    packs.push(PackRecord { id: pack_id, blobs });
                }
            }
        }
        for p in &mut packs {
            p.blobs.sort_by_key(|b| b.offset);
        }

        let file = IndexFile {
            version: INDEX_VERSION,
            supersedes: state.supersedes.clone(),
            packs,
        };
        Ok(rmp_serde::to_vec(&file)?)
    }

    /// Parse an index file. The result is finalized but carries no ID.
    pub fn decode(data: &[u8], config: &IndexConfig) -> Result<Index> {
        let file: IndexFile = rmp_serde::from_slice(data)?;
        if file.version != INDEX_VERSION {
            return Err(BalerError::InvalidFormat(format!(
                "unsupported index version {}",
                file.version
            )));
        }
        let index = Index::new(config);
        {
            let mut state = index.write();
            for pack in file.packs {
                let pack_index = state.add_pack(pack.id);
                for b in pack.blobs {
                    state.by_kind[b.kind.slot()].add(
                        b.id,
                        pack_index,
                        b.offset,
                        b.length,
                        b.uncompressed_length,
                    );
                }
            }
            state.supersedes = file.supersedes;
            state.finalized = true;
        }
        Ok(index)
    }
}

fn index_handle(id: &IndexId) -> Handle {
    Handle::new(FileType::Index, id.to_hex())
}

/// Load one index file, verifying its content against its name.
pub fn load_index(backend: &dyn Backend, id: &IndexId, config: &IndexConfig) -> Result<Index> {
    let data = backend.load_all(&index_handle(id))?;
    let actual = IndexId::compute(&data);
    if actual != *id {
        return Err(BalerError::HashMismatch {
            what: format!("index {id}"),
            expected: id.to_hex(),
            actual: actual.to_hex(),
        });
    }
    let index = Index::decode(&data, config)?;
    index.set_id(*id)?;
    Ok(index)
}

/// Persist a finalized index and attach the resulting ID to it.
pub fn save_index(backend: &dyn Backend, index: &Index) -> Result<IndexId> {
    if !index.is_finalized() {
        return Err(BalerError::IndexNotFinalized);
    }
    let data = index.encode()?;
    let id = IndexId::compute(&data);
    let content_hash = backend.hasher().map(|h| h.digest(&data));
    match backend.save(&index_handle(&id), &data, content_hash.as_ref()) {
        Ok(()) => {}
        // Content-addressed: an existing file with this name has these bytes.
        Err(BalerError::AlreadyExists(_)) => {
            debug!(index = %id, "index file already present");
        }
        Err(e) => return Err(e),
    }
    index.set_id(id)?;
    debug!(index = %id, blobs = index.len(), bytes = data.len(), "saved index");
    Ok(id)
}

/// IDs of all index files in the backend. Unparseable names are skipped.
pub fn list_index_ids(backend: &dyn Backend) -> Result<Vec<IndexId>> {
    let mut ids = Vec::new();
    for info in backend.list(FileType::Index)? {
        match IndexId::from_hex(&info.name) {
            Ok(id) => ids.push(id),
            Err(e) => warn!(name = %info.name, error = %e, "ignoring index file with invalid name"),
        }
    }
    ids.sort();
    Ok(ids)
}

/// Load every index file in parallel and hand each result to `f`.
///
/// Load failures are passed to `f` rather than aborting the walk; an error
/// returned by `f` stops it and is returned.
pub fn for_all_indexes<F>(
    backend: &dyn Backend,
    config: &IndexConfig,
    cancel: &CancelToken,
    f: F,
) -> Result<()>
where
    F: Fn(IndexId, Result<Index>) -> Result<()> + Sync,
{
    let ids = list_index_ids(backend)?;
    ids.par_iter().try_for_each(|id| {
        cancel.check()?;
        f(*id, load_index(backend, id, config))
    })
}
