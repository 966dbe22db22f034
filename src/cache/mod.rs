//! The cache store: named, generation-tagged partitions of response snapshots.
//!
//! Two partition families are versioned per proxy generation — `static`
//! (long-lived assets, populated at install) and `runtime` (responses
//! captured opportunistically). The `warm` partition sits outside the
//! versioning scheme so UI-seeded data survives generation changes.
//!
//! Partitions live in memory and are mirrored to one JSON file each under
//! the store directory. Disk I/O is strictly best-effort: a failed write or
//! an unreadable file is logged and treated as an empty cache, never as an
//! error the request path can observe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::{debug, warn};

pub mod snapshot;

pub use snapshot::{CacheKey, ResponseSnapshot};

/// Base name of the install-time asset partition.
pub const STATIC_BASE: &str = "static";

/// Base name of the opportunistic runtime partition.
pub const RUNTIME_BASE: &str = "runtime";

/// Name of the un-versioned partition used by `WARM` control commands.
pub const WARM_PARTITION: &str = "warm";

/// Returns the partition name for a base and generation, e.g. `static-v3`.
pub fn versioned_name(base: &str, generation: u64) -> String {
    format!("{base}-v{generation}")
}

/// Returns `true` if the partition name carries a generation tag.
///
/// Un-versioned partitions (like `warm`) are never candidates for the
/// activation sweep.
pub fn is_versioned(name: &str) -> bool {
    match name.rfind("-v") {
        Some(pos) => {
            let digits = &name[pos + 2..];
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

type Partition = HashMap<CacheKey, ResponseSnapshot>;

/// The proxy's cache store.
///
/// Shared across all concurrently handled requests; the in-memory map is
/// guarded by an `RwLock` held only for non-awaiting critical sections.
/// Last writer to a key wins — there are no merge semantics.
#[derive(Debug)]
pub struct CacheStore {
    dir: Option<PathBuf>,
    partitions: RwLock<HashMap<String, Partition>>,
}

impl CacheStore {
    /// Creates a store with no disk mirror. Useful for tests and for
    /// deployments that accept losing the cache on restart.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a store mirrored under `dir`, loading every partition file
    /// found there.
    ///
    /// Missing directories are created. Unreadable or corrupt partition
    /// files are skipped with a warning — the cache starts empty for them.
    pub async fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut partitions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Partition>(&bytes) {
                    Ok(partition) => {
                        debug!(partition = name, entries = partition.len(), "partition loaded");
                        partitions.insert(name.to_owned(), partition);
                    }
                    Err(e) => {
                        warn!(partition = name, error = %e, "corrupt partition file — starting empty");
                    }
                },
                Err(e) => {
                    warn!(partition = name, error = %e, "unreadable partition file — starting empty");
                }
            }
        }

        Ok(Self {
            dir: Some(dir),
            partitions: RwLock::new(partitions),
        })
    }

    /// Looks up a key in one partition.
    pub fn read(&self, partition: &str, key: &CacheKey) -> Option<ResponseSnapshot> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.get(partition)?.get(key).cloned()
    }

    /// Looks up a key across every partition, in unspecified order.
    ///
    /// Used by the passthrough strategy, which has no partition of its own.
    pub fn read_any(&self, key: &CacheKey) -> Option<ResponseSnapshot> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.values().find_map(|p| p.get(key).cloned())
    }

    /// Stores a snapshot, creating the partition if needed, then mirrors
    /// the partition to disk best-effort.
    pub async fn write(&self, partition: &str, key: CacheKey, snapshot: ResponseSnapshot) {
        {
            let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
            partitions
                .entry(partition.to_owned())
                .or_default()
                .insert(key, snapshot);
        }
        self.persist(partition).await;
    }

    /// Returns the names of all existing partitions.
    pub fn partition_names(&self) -> Vec<String> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.keys().cloned().collect()
    }

    /// Returns the number of entries in a partition (0 if absent).
    pub fn partition_len(&self, partition: &str) -> usize {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.get(partition).map_or(0, HashMap::len)
    }

    /// Deletes one partition and its disk mirror. Returns `true` if the
    /// partition existed in memory.
    pub async fn drop_partition(&self, partition: &str) -> bool {
        let existed = {
            let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
            partitions.remove(partition).is_some()
        };
        if let Some(path) = self.partition_path(partition) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(partition, error = %e, "failed to remove partition file");
                }
            }
        }
        existed
    }

    /// Deletes every partition across all generations, including `warm`.
    pub async fn purge_all(&self) {
        let names: Vec<String> = {
            let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
            partitions.drain().map(|(name, _)| name).collect()
        };
        for name in names {
            if let Some(path) = self.partition_path(&name) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(partition = %name, error = %e, "failed to remove partition file");
                    }
                }
            }
        }
    }

    fn partition_path(&self, partition: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{partition}.json")))
    }

    /// Mirrors one partition to its JSON file. Failures are logged and
    /// swallowed: cache I/O must never block or fail a response.
    async fn persist(&self, partition: &str) {
        let Some(path) = self.partition_path(partition) else {
            return;
        };
        let serialized = {
            let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
            let Some(p) = partitions.get(partition) else {
                return;
            };
            match serde_json::to_vec(p) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(partition, error = %e, "failed to serialize partition");
                    return;
                }
            }
        };
        if let Err(e) = tokio::fs::write(&path, serialized).await {
            warn!(partition, error = %e, "failed to mirror partition to disk");
        }
    }
}
