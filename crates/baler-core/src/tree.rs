use std::collections::BTreeMap;

use baler_types::{BalerError, BlobHandle, BlobId, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Dev,
    Chardev,
    Fifo,
    Socket,
    Irregular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedAttribute {
    pub name: String,
    pub value: Vec<u8>,
}

/// Platform-specific attributes carried in [`Node::generic_attributes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericAttribute {
    CreationTime(DateTime<Utc>),
    FileAttributes(u32),
    SecurityDescriptor(Vec<u8>),
}

impl GenericAttribute {
    pub const CREATION_TIME: &'static str = "windows.creation_time";
    pub const FILE_ATTRIBUTES: &'static str = "windows.file_attributes";
    pub const SECURITY_DESCRIPTOR: &'static str = "windows.security_descriptor";

    pub fn key(&self) -> &'static str {
        match self {
            GenericAttribute::CreationTime(_) => Self::CREATION_TIME,
            GenericAttribute::FileAttributes(_) => Self::FILE_ATTRIBUTES,
            GenericAttribute::SecurityDescriptor(_) => Self::SECURITY_DESCRIPTOR,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            GenericAttribute::CreationTime(t) => {
                t.timestamp_nanos_opt().unwrap_or(0).to_le_bytes().to_vec()
            }
            GenericAttribute::FileAttributes(a) => a.to_le_bytes().to_vec(),
            GenericAttribute::SecurityDescriptor(sd) => sd.clone(),
        }
    }

    fn decode(key: &str, raw: &[u8]) -> Option<Result<Self>> {
        let fixed = |n: usize| -> Result<&[u8]> {
            if raw.len() == n {
                Ok(raw)
            } else {
                Err(BalerError::InvalidFormat(format!(
                    "generic attribute {key}: expected {n} bytes, got {}",
                    raw.len()
                )))
            }
        };
        let parsed = match key {
            Self::CREATION_TIME => fixed(8).map(|b| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                GenericAttribute::CreationTime(Utc.timestamp_nanos(i64::from_le_bytes(buf)))
            }),
            Self::FILE_ATTRIBUTES => fixed(4).map(|b| {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(b);
                GenericAttribute::FileAttributes(u32::from_le_bytes(buf))
            }),
            Self::SECURITY_DESCRIPTOR => Ok(GenericAttribute::SecurityDescriptor(raw.to_vec())),
            _ => return None,
        };
        Some(parsed)
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    /// Data blobs of a file, in order. `None` on a file node is an error;
    /// an empty file has `Some(vec![])`.
    #[serde(default)]
    pub content: Option<Vec<BlobId>>,
    /// Tree blob of a directory.
    #[serde(default)]
    pub subtree: Option<BlobId>,
    #[serde(default)]
    pub link_target: Option<String>,
    #[serde(default)]
    pub extended_attributes: Vec<ExtendedAttribute>,
    #[serde(default)]
    pub generic_attributes: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn empty(name: &str, node_type: NodeType) -> Self {
        Self {
            name: name.to_string(),
            node_type,
            mode: 0,
            size: 0,
            mtime: None,
            content: None,
            subtree: None,
            link_target: None,
            extended_attributes: Vec::new(),
            generic_attributes: BTreeMap::new(),
        }
    }

    pub fn file(name: &str, content: Vec<BlobId>, size: u64) -> Self {
        Self {
            mode: 0o644,
            size,
            content: Some(content),
            ..Self::empty(name, NodeType::File)
        }
    }

    pub fn dir(name: &str, subtree: BlobId) -> Self {
        Self {
            mode: 0o755,
            subtree: Some(subtree),
            ..Self::empty(name, NodeType::Dir)
        }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            mode: 0o777,
            link_target: Some(target.to_string()),
            ..Self::empty(name, NodeType::Symlink)
        }
    }

    pub fn set_generic_attribute(&mut self, attr: GenericAttribute) {
        self.generic_attributes
            .insert(attr.key().to_string(), attr.encode());
    }

    /// Decode the known generic attributes. Keys this version does not
    /// understand are returned separately so callers can warn about them.
    pub fn decode_generic_attributes(&self) -> Result<(Vec<GenericAttribute>, Vec<String>)> {
        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for (key, raw) in &self.generic_attributes {
            match GenericAttribute::decode(key, raw) {
                Some(attr) => known.push(attr?),
                None => unknown.push(key.clone()),
            }
        }
        Ok((known, unknown))
    }
}

/// A directory listing, stored as a tree blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping nodes sorted by name. Names must be unique.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        match self.nodes.binary_search_by(|n| n.name.as_str().cmp(&node.name)) {
            Ok(_) => Err(BalerError::Other(format!(
                "node {:?} already present in tree",
                node.name
            ))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Every subtree ID referenced by directory nodes.
    pub fn subtrees(&self) -> Vec<BlobId> {
        self.nodes.iter().filter_map(|n| n.subtree).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Where tree traversals load trees and look up blob sizes.
pub trait TreeSource: Send + Sync {
    fn load_tree(&self, id: &BlobId) -> Result<Tree>;

    /// Plaintext size of an indexed blob, `None` if the index has no entry.
    fn lookup_blob_size(&self, handle: &BlobHandle) -> Option<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_order_and_rejects_duplicates() {
        let mut t = Tree::new();
        t.insert(Node::file("b", vec![], 0)).unwrap();
        t.insert(Node::file("a", vec![], 0)).unwrap();
        t.insert(Node::symlink("c", "/tmp")).unwrap();
        let names: Vec<_> = t.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(t.insert(Node::file("a", vec![], 0)).is_err());
        assert!(t.find("b").is_some());
        assert!(t.find("zz").is_none());
    }

    #[test]
    fn tree_survives_encoding() {
        let mut t = Tree::new();
        t.insert(Node::file("f", vec![BlobId::compute(b"x")], 1)).unwrap();
        t.insert(Node::dir("d", BlobId::compute(b"y"))).unwrap();
        let back = Tree::decode(&t.encode().unwrap()).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.subtrees(), vec![BlobId::compute(b"y")]);
    }

    #[test]
    fn generic_attributes_with_unknown_keys() {
        let mut n = Node::file("f", vec![], 0);
        n.set_generic_attribute(GenericAttribute::FileAttributes(0x20));
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        n.set_generic_attribute(GenericAttribute::CreationTime(created));
        n.generic_attributes
            .insert("future.attribute".into(), vec![1, 2, 3]);

        let (known, unknown) = n.decode_generic_attributes().unwrap();
        assert_eq!(unknown, vec!["future.attribute".to_string()]);
        assert!(known.contains(&GenericAttribute::FileAttributes(0x20)));
        assert!(known.contains(&GenericAttribute::CreationTime(created)));
    }

    #[test]
    fn malformed_generic_attribute_is_an_error() {
        let mut n = Node::file("f", vec![], 0);
        n.generic_attributes
            .insert(GenericAttribute::FILE_ATTRIBUTES.into(), vec![1]);
        assert!(n.decode_generic_attributes().is_err());
    }
}
