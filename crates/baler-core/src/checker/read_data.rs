use std::collections::{HashMap, HashSet};

use baler_types::{BlobHandle, BlobId, PackId};
use crossbeam_channel::Sender;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{CheckError, Checker};
use crate::cancel::{send_or_cancel, CancelToken};
use crate::index::PackedBlob;
use crate::repo::pack::{pack_handle, parse_pack};

impl Checker {
    /// Download and verify every indexed pack.
    pub fn read_data(&self, cancel: &CancelToken, tx: &Sender<CheckError>) {
        let all: HashSet<PackId> = self.packs.keys().copied().collect();
        self.read_packs(&all, cancel, tx);
    }

    /// Download and verify the given packs.
    ///
    /// A pack that fails verification is read exactly once more. If the second
    /// read is clean the pack is reported as recovered, carrying the first
    /// error; otherwise the errors of the second read are reported.
    pub fn read_packs(
        &self,
        packs: &HashSet<PackId>,
        cancel: &CancelToken,
        tx: &Sender<CheckError>,
    ) {
        let by_pack = self.index.each_by_pack(Some(packs));
        let work: Vec<(PackId, Vec<PackedBlob>)> = by_pack.into_iter().collect();
        info!(packs = work.len(), "check: reading pack data");

        self.pool.install(|| {
            work.par_iter().for_each(|(pack, blobs)| {
                if cancel.is_cancelled() {
                    return;
                }
                let first = match self.verify_pack(pack, blobs) {
                    Ok(()) => return,
                    Err(errors) => errors,
                };
                let original = describe(&first);
                warn!(pack = %pack, error = %original, "pack verification failed, retrying");
                match self.verify_pack(pack, blobs) {
                    Ok(()) => {
                        send_or_cancel(
                            tx,
                            cancel,
                            CheckError::RecoveredOnRetry {
                                pack: *pack,
                                original,
                            },
                        );
                    }
                    Err(errors) => {
                        for e in errors {
                            if !send_or_cancel(tx, cancel, e) {
                                return;
                            }
                        }
                    }
                }
            });
        });
    }

    /// Read one pack in full and check its ID, header and every indexed blob.
    fn verify_pack(&self, pack: &PackId, blobs: &[PackedBlob]) -> Result<(), Vec<CheckError>> {
        let bytes = self
            .repo
            .backend()
            .load_all(&pack_handle(pack))
            .map_err(|e| {
                vec![CheckError::PackRead {
                    pack: *pack,
                    reason: e.to_string(),
                }]
            })?;

        let mut errors = Vec::new();
        let actual = PackId::compute(&bytes);
        if actual != *pack {
            errors.push(CheckError::PackHashMismatch {
                pack: *pack,
                actual,
            });
        }

        match parse_pack(&bytes) {
            Ok(header) => {
                let in_header: HashMap<(BlobHandle, u32), u32> = header
                    .iter()
                    .map(|e| ((e.handle(), e.offset), e.length))
                    .collect();
                for b in blobs {
                    match in_header.get(&(b.handle, b.offset)) {
                        Some(&length) if length == b.length => {}
                        Some(&length) => errors.push(CheckError::PackHeader {
                            pack: *pack,
                            reason: format!(
                                "blob {} has length {length} in header but {} in index",
                                b.handle, b.length
                            ),
                        }),
                        None => errors.push(CheckError::PackHeader {
                            pack: *pack,
                            reason: format!(
                                "blob {} at offset {} missing from header",
                                b.handle, b.offset
                            ),
                        }),
                    }
                }
            }
            Err(e) => errors.push(CheckError::PackHeader {
                pack: *pack,
                reason: e.to_string(),
            }),
        }

        for b in blobs {
            let start = b.offset as usize;
            let Some(data) = bytes.get(start..start + b.length as usize) else {
                errors.push(CheckError::Blob {
                    pack: *pack,
                    handle: b.handle,
                    reason: format!(
                        "range {}+{} beyond pack size {}",
                        b.offset,
                        b.length,
                        bytes.len()
                    ),
                });
                continue;
            };
            let actual = BlobId::compute(data);
            if actual != b.handle.id {
                errors.push(CheckError::Blob {
                    pack: *pack,
                    handle: b.handle,
                    reason: format!("content hashes to {actual}"),
                });
            }
        }

        if errors.is_empty() {
            debug!(pack = %pack, blobs = blobs.len(), "pack verified");
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn describe(errors: &[CheckError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
