use std::collections::HashSet;
use std::sync::Mutex;

use baler_types::{BlobHandle, BlobId, BlobKind};
use crossbeam_channel::Sender;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{CheckError, Checker, TreeIssue};
use crate::cancel::{send_or_cancel, CancelToken};
use crate::tree::{Node, NodeType, Tree};

/// Predicate over tree IDs; trees for which it returns true are skipped.
pub type TreeFilter = dyn Fn(&BlobId) -> bool + Sync;

/// Trees already claimed by some worker. Claiming happens before loading,
/// so each tree is loaded at most once per run.
struct Visited(Mutex<HashSet<BlobId>>);

impl Visited {
    fn claim(&self, id: BlobId) -> bool {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).insert(id)
    }
}

impl Checker {
    /// Walk the tree graph of every loaded snapshot.
    ///
    /// Trees are processed level by level on the checker's worker pool.
    /// Problems are reported per tree; a tree that cannot be loaded is
    /// reported and its subtrees are not visited.
    pub fn structure(
        &self,
        cancel: &CancelToken,
        exclude: Option<&TreeFilter>,
        tx: &Sender<CheckError>,
    ) {
        for e in &self.snapshot_errors {
            if !send_or_cancel(tx, cancel, e.clone()) {
                return;
            }
        }

        let visited = Visited(Mutex::new(HashSet::new()));
        let mut frontier = Vec::new();
        for (snapshot, root) in &self.roots {
            if self.source.lookup_blob_size(&BlobHandle::tree(*root)).is_none() {
                let e = CheckError::SnapshotLoad {
                    snapshot: *snapshot,
                    reason: format!("root tree {root} not found in index"),
                };
                if !send_or_cancel(tx, cancel, e) {
                    return;
                }
                continue;
            }
            if visited.claim(*root) {
                frontier.push(*root);
            }
        }

        let mut depth = 0usize;
        let mut trees = 0usize;
        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                return;
            }
            trees += frontier.len();
            debug!(depth, trees = frontier.len(), "check: tree level");
            frontier = self.pool.install(|| {
                frontier
                    .par_iter()
                    .flat_map_iter(|id| self.visit_tree(id, cancel, exclude, &visited, tx))
                    .collect()
            });
            depth += 1;
        }
        info!(trees, depth, "check: structure done");
    }

    /// Load and check one tree. Returns the subtrees this worker claimed.
    fn visit_tree(
        &self,
        id: &BlobId,
        cancel: &CancelToken,
        exclude: Option<&TreeFilter>,
        visited: &Visited,
        tx: &Sender<CheckError>,
    ) -> Vec<BlobId> {
        if cancel.is_cancelled() {
            return Vec::new();
        }
        if exclude.is_some_and(|skip| skip(id)) {
            self.note_excluded(id);
            return Vec::new();
        }
        let tree = match self.source.load_tree(id) {
            Ok(tree) => tree,
            Err(e) => {
                send_or_cancel(
                    tx,
                    cancel,
                    CheckError::Tree {
                        tree: *id,
                        issues: vec![TreeIssue::LoadFailed {
                            reason: e.to_string(),
                        }],
                    },
                );
                return Vec::new();
            }
        };
        self.mark_used(BlobHandle::tree(*id));

        let mut issues = Vec::new();
        let mut children = Vec::new();
        self.check_tree(&tree, visited, &mut issues, &mut children);
        if !issues.is_empty() {
            send_or_cancel(tx, cancel, CheckError::Tree { tree: *id, issues });
        }
        children
    }

    fn check_tree(
        &self,
        tree: &Tree,
        visited: &Visited,
        issues: &mut Vec<TreeIssue>,
        children: &mut Vec<BlobId>,
    ) {
        for node in &tree.nodes {
            match node.node_type {
                NodeType::File => {
                    if node.subtree.is_some() {
                        issues.push(TreeIssue::FileWithSubtree {
                            node: node.name.clone(),
                        });
                    }
                    match &node.content {
                        None => issues.push(TreeIssue::NilContent {
                            node: node.name.clone(),
                        }),
                        Some(blobs) => {
                            for blob in blobs {
                                self.check_reference(node, BlobHandle::data(*blob), issues);
                            }
                        }
                    }
                }
                NodeType::Dir => {
                    if node.content.as_ref().is_some_and(|c| !c.is_empty()) {
                        issues.push(TreeIssue::DirWithContent {
                            node: node.name.clone(),
                        });
                    }
                    match node.subtree {
                        None => issues.push(TreeIssue::MissingSubtree {
                            node: node.name.clone(),
                        }),
                        Some(sub) if sub.is_null() => issues.push(TreeIssue::NullSubtree {
                            node: node.name.clone(),
                        }),
                        Some(sub) => {
                            if self.check_reference(node, BlobHandle::tree(sub), issues)
                                && visited.claim(sub)
                            {
                                children.push(sub);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Check that `handle` is indexed with its own kind. An ID present only
    /// under the other kind is reported as such instead of as missing.
    fn check_reference(
        &self,
        node: &Node,
        handle: BlobHandle,
        issues: &mut Vec<TreeIssue>,
    ) -> bool {
        if self.source.lookup_blob_size(&handle).is_some() {
            if handle.kind == BlobKind::Data {
                self.mark_used(handle);
            }
            return true;
        }
        let other = BlobHandle::new(handle.id, handle.kind.other());
        if self.source.lookup_blob_size(&other).is_some() {
            issues.push(TreeIssue::WrongBlobKind {
                node: node.name.clone(),
                id: handle.id,
                expected: handle.kind,
                found: other.kind,
            });
        } else {
            issues.push(TreeIssue::MissingBlob {
                node: node.name.clone(),
                handle,
            });
        }
        false
    }
}
