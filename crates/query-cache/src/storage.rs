//! Storage levels and the block store
//!
//! Every materialized partition becomes one block. Blocks are written once and
//! never modified. The store keeps a registry of the blocks that currently
//! back a live cache entry; the bytes themselves are owned by [`StoredBlock`]
//! values and are freed when the last reader drops them.

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use parking_lot::Mutex;
use query_core::{Partition, QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Where materialized partitions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageLevel {
    MemoryOnly,
    /// Memory first; spilling only happens under eviction, which the cache
    /// never performs, so blocks stay in memory
    MemoryAndDisk,
    DiskOnly,
}

impl StorageLevel {
    pub fn uses_memory(&self) -> bool {
        !matches!(self, StorageLevel::DiskOnly)
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageLevel::MemoryOnly => "MEMORY_ONLY",
            StorageLevel::MemoryAndDisk => "MEMORY_AND_DISK",
            StorageLevel::DiskOnly => "DISK_ONLY",
        };
        write!(f, "{}", s)
    }
}

/// Unique identifier for a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", &self.0.to_string()[..8])
    }
}

/// One partition of one cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub entry: EntryId,
    pub partition: usize,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-p{}", self.entry, self.partition)
    }
}

/// Registry record for a live block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub level: StorageLevel,
    pub rows: usize,
    pub size_bytes: u64,
}

#[derive(Debug)]
enum BlockData {
    Memory(Vec<RecordBatch>),
    Disk(DiskBlock),
}

/// Arrow IPC file removed when the block is dropped
#[derive(Debug)]
struct DiskBlock {
    path: PathBuf,
}

impl Drop for DiskBlock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove block file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Immutable contents of one materialized partition
#[derive(Debug)]
pub struct StoredBlock {
    id: BlockId,
    info: BlockInfo,
    data: BlockData,
}

impl StoredBlock {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn info(&self) -> &BlockInfo {
        &self.info
    }

    /// Read the block back as a partition
    pub fn read(&self) -> Result<Partition> {
        let batches = match &self.data {
            BlockData::Memory(batches) => batches.clone(),
            BlockData::Disk(block) => {
                let file = File::open(&block.path).map_err(|e| {
                    QueryError::CacheError(format!("block {} is unreadable: {}", self.id, e))
                })?;
                let reader = FileReader::try_new(file, None)?;
                reader.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(Partition::with_batches(self.id.partition, batches))
    }
}

/// Per-engine store of cache blocks
#[derive(Debug)]
pub struct BlockStore {
    live: DashMap<BlockId, BlockInfo>,
    spill_dir: Option<PathBuf>,
    temp_dir: Mutex<Option<Arc<TempDir>>>,
}

impl BlockStore {
    /// Create a store that spills into `spill_dir`, or into a private
    /// temporary directory when none is given
    pub fn new(spill_dir: Option<PathBuf>) -> Self {
        Self {
            live: DashMap::new(),
            spill_dir,
            temp_dir: Mutex::new(None),
        }
    }

    /// Write a partition at `level`. The block is not registered yet.
    pub fn write_block(
        &self,
        id: BlockId,
        level: StorageLevel,
        schema: &SchemaRef,
        partition: &Partition,
        size_bytes: u64,
    ) -> Result<StoredBlock> {
        let info = BlockInfo {
            level,
            rows: partition.row_count(),
            size_bytes,
        };
        let data = if level.uses_memory() {
            BlockData::Memory(partition.batches.clone())
        } else {
            let path = self.block_dir()?.join(format!("{}.arrow", id));
            write_ipc(&path, schema, &partition.batches)?;
            BlockData::Disk(DiskBlock { path })
        };
        tracing::debug!("Stored block {} ({} rows, {})", id, info.rows, level);
        Ok(StoredBlock { id, info, data })
    }

    /// Mark blocks as backing a live entry
    pub fn register(&self, blocks: &[StoredBlock]) {
        for block in blocks {
            self.live.insert(block.id, block.info.clone());
        }
    }

    /// Forget every block of `entry`; returns how many were removed
    pub fn unregister_entry(&self, entry: EntryId) -> usize {
        let before = self.live.len();
        self.live.retain(|id, _| id.entry != entry);
        before.saturating_sub(self.live.len())
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.live.contains_key(id)
    }

    pub fn blocks_for(&self, entry: EntryId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .live
            .iter()
            .filter(|item| item.key().entry == entry)
            .map(|item| *item.key())
            .collect();
        ids.sort_by_key(|id| id.partition);
        ids
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Bytes held by live blocks at memory levels
    pub fn memory_bytes(&self) -> u64 {
        self.bytes_where(|level| level.uses_memory())
    }

    /// Bytes held by live blocks on disk
    pub fn disk_bytes(&self) -> u64 {
        self.bytes_where(|level| !level.uses_memory())
    }

    fn bytes_where(&self, pred: impl Fn(StorageLevel) -> bool) -> u64 {
        self.live
            .iter()
            .filter(|item| pred(item.value().level))
            .map(|item| item.value().size_bytes)
            .sum()
    }

    fn block_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.spill_dir {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }
        let mut temp = self.temp_dir.lock();
        if temp.is_none() {
            let dir = tempfile::Builder::new().prefix("query-cache-").tempdir()?;
            tracing::debug!("Created block directory {}", dir.path().display());
            *temp = Some(Arc::new(dir));
        }
        match temp.as_ref() {
            Some(dir) => Ok(dir.path().to_path_buf()),
            None => Err(QueryError::CacheError(
                "block directory unavailable".to_string(),
            )),
        }
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new(None)
    }
}

fn write_ipc(path: &Path, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(file, schema.as_ref())?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    Ok(())
}
