use baler_types::{BlobId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time record naming the root tree of one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    /// Root tree. A snapshot without one is damaged.
    #[serde(default)]
    pub tree: Option<BlobId>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn new(tree: BlobId, paths: Vec<String>) -> Self {
        Self {
            time: Utc::now(),
            tree: Some(tree),
            paths,
            hostname: String::new(),
            username: String::new(),
            tags: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
