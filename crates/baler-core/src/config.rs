use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BalerError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalerConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub prune: PruneConfig,
}

impl BalerConfig {
    /// Load and parse a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BalerError::Config(format!("cannot read '{}': {e}", path.display())))?;
        Self::from_yaml_str(&contents)
            .map_err(|e| BalerError::Config(format!("invalid config '{}': {e}", path.display())))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: BalerConfig =
            serde_yaml::from_str(contents).map_err(|e| BalerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let index = &self.index;
        if index.initial_buckets == 0 || !index.initial_buckets.is_power_of_two() {
            return Err(BalerError::Config(format!(
                "index.initial_buckets must be a power of two, got {}",
                index.initial_buckets
            )));
        }
        if index.arena_block_entries == 0 || !index.arena_block_entries.is_power_of_two() {
            return Err(BalerError::Config(format!(
                "index.arena_block_entries must be a power of two, got {}",
                index.arena_block_entries
            )));
        }
        if index.max_load == 0 {
            return Err(BalerError::Config("index.max_load must be positive".into()));
        }
        if index.max_blobs_per_file == 0 {
            return Err(BalerError::Config(
                "index.max_blobs_per_file must be positive".into(),
            ));
        }
        if self.repository.max_blobs_per_pack == 0 {
            return Err(BalerError::Config(
                "repository.max_blobs_per_pack must be positive".into(),
            ));
        }
        if self.check.error_queue_capacity == 0 {
            return Err(BalerError::Config(
                "check.error_queue_capacity must be positive".into(),
            ));
        }
        UnusedLimit::parse(&self.prune.max_unused)?;
        if let Some(size) = &self.prune.max_repack_size {
            parse_size(size)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Pack writer flush target; packs below it count as small during prune.
    #[serde(default = "default_min_pack_size")]
    pub min_pack_size: u32,
    #[serde(default = "default_max_blobs_per_pack")]
    pub max_blobs_per_pack: usize,
    /// A partially filled pack is uploaded once its first blob is this old.
    #[serde(default = "default_pack_max_age_secs")]
    pub pack_max_age_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            min_pack_size: default_min_pack_size(),
            max_blobs_per_pack: default_max_blobs_per_pack(),
            pack_max_age_secs: default_pack_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Bucket count allocated on first insert. Power of two.
    #[serde(default = "default_initial_buckets")]
    pub initial_buckets: usize,
    /// Average chain length that triggers doubling the bucket array.
    #[serde(default = "default_max_load")]
    pub max_load: usize,
    /// Entries in the first arena block. Power of two.
    #[serde(default = "default_arena_block_entries")]
    pub arena_block_entries: usize,
    /// Blob count at which an index is written out as its own file.
    #[serde(default = "default_max_blobs_per_file")]
    pub max_blobs_per_file: usize,
    /// In-progress indexes older than this count as full.
    #[serde(default = "default_full_age_secs")]
    pub full_age_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            initial_buckets: default_initial_buckets(),
            max_load: default_max_load(),
            arena_block_entries: default_arena_block_entries(),
            max_blobs_per_file: default_max_blobs_per_file(),
            full_age_secs: default_full_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Worker threads for structure and data checks. 0 = available parallelism.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_error_queue_capacity")]
    pub error_queue_capacity: usize,
    /// Record every referenced blob so unused ones can be listed afterwards.
    #[serde(default)]
    pub track_unused: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            error_queue_capacity: default_error_queue_capacity(),
            track_unused: false,
        }
    }
}

impl CheckConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Tolerated unused space: `"5%"`, `"0"`, `"unlimited"` or a size like `"100M"`.
    #[serde(default = "default_max_unused")]
    pub max_unused: String,
    /// Upper bound on bytes rewritten by one prune run.
    #[serde(default)]
    pub max_repack_size: Option<String>,
    #[serde(default)]
    pub repack_cacheable_only: bool,
    #[serde(default)]
    pub repack_small: bool,
    #[serde(default)]
    pub unsafe_recovery: bool,
    /// Number of small packs needed before they are repacked without `repack_small`.
    #[serde(default = "default_small_pack_min_count")]
    pub small_pack_min_count: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_unused: default_max_unused(),
            max_repack_size: None,
            repack_cacheable_only: false,
            repack_small: false,
            unsafe_recovery: false,
            small_pack_min_count: default_small_pack_min_count(),
        }
    }
}

fn default_min_pack_size() -> u32 {
    16 * 1024 * 1024 // 16 MiB
}

fn default_max_blobs_per_pack() -> usize {
    10_000
}

fn default_pack_max_age_secs() -> u64 {
    300
}

fn default_initial_buckets() -> usize {
    64
}

fn default_max_load() -> usize {
    4
}

fn default_arena_block_entries() -> usize {
    256
}

fn default_max_blobs_per_file() -> usize {
    50_000
}

fn default_full_age_secs() -> u64 {
    10 * 60
}

fn default_error_queue_capacity() -> usize {
    64
}

fn default_max_unused() -> String {
    "5%".to_string()
}

fn default_small_pack_min_count() -> usize {
    10
}

/// Parse a byte size such as `"512"`, `"100K"`, `"5M"` or `"2G"` (binary units).
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(BalerError::Config("empty size".into()));
    }
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((pos, _)) => s.split_at(pos),
        None => (s, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| BalerError::Config(format!("invalid size '{input}'")))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => {
            return Err(BalerError::Config(format!(
                "invalid size unit '{other}' in '{input}'"
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| BalerError::Config(format!("size '{input}' overflows")))
}

/// How much unused space prune may leave behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnusedLimit {
    Unlimited,
    /// Percentage of the repository size remaining after prune.
    Percent(f64),
    Bytes(u64),
}

impl UnusedLimit {
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(UnusedLimit::Unlimited);
        }
        if let Some(p) = s.strip_suffix('%') {
            let p: f64 = p
                .trim()
                .parse()
                .map_err(|_| BalerError::Config(format!("invalid percentage '{input}'")))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(BalerError::Config(format!(
                    "percentage must be between 0% and 100%, got '{input}'"
                )));
            }
            if p >= 100.0 {
                return Ok(UnusedLimit::Unlimited);
            }
            return Ok(UnusedLimit::Percent(p));
        }
        Ok(UnusedLimit::Bytes(parse_size(s)?))
    }

    /// Maximum unused bytes given the bytes still in use.
    ///
    /// A percentage `p` is relative to the final repository size, so with
    /// `used` bytes kept the allowance is `used * p / (100 - p)`.
    pub fn limit(&self, used: u64) -> u64 {
        match *self {
            UnusedLimit::Unlimited => u64::MAX,
            UnusedLimit::Percent(p) => (p / (100.0 - p) * used as f64) as u64,
            UnusedLimit::Bytes(b) => b,
        }
    }
}

impl fmt::Display for UnusedLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnusedLimit::Unlimited => f.write_str("unlimited"),
            UnusedLimit::Percent(p) => write!(f, "{p}%"),
            UnusedLimit::Bytes(b) => write!(f, "{b} bytes"),
        }
    }
}
