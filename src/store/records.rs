//! Metadata persistence with compare-and-swap writes
//!
//! Every record carries a generation number. Writers state the generation
//! they read and the backend refuses the write when another writer committed
//! in between. That refusal is what lets the content store detect
//! concurrent modification across processes; an overwrite-only backend
//! could not.

use crate::error::{DepotError, DepotResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Logical record tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// One row per artifact key
    Artifacts,
    /// One row per metadata document
    Metadata,
    /// One row per browse node, keyed by display path
    BrowseNodes,
    /// Blobs no record references any more, keyed by blob reference
    Orphans,
}

impl Table {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Artifacts => "artifacts",
            Self::Metadata => "metadata",
            Self::BrowseNodes => "browse",
            Self::Orphans => "orphans",
        }
    }
}

/// A stored record and its generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub id: String,
    pub generation: u64,
    pub value: serde_json::Value,
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { generation: u64 },
    /// Another writer got there first; `current` is what it left behind
    Conflict { current: Option<u64> },
}

/// Document store supporting conditional writes
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point read
    async fn load(&self, table: Table, repository: &str, id: &str)
        -> DepotResult<Option<Versioned>>;

    /// Write `value` only if the stored generation equals `expected`
    /// (`None` meaning the record must not exist yet)
    async fn compare_and_swap(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> DepotResult<WriteOutcome>;

    /// Unconditional write, for tables with a single writer
    async fn upsert(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        value: serde_json::Value,
    ) -> DepotResult<u64>;

    /// Unconditional delete, returning the removed record
    async fn remove(&self, table: Table, repository: &str, id: &str)
        -> DepotResult<Option<Versioned>>;

    /// Delete every record of a repository in `table`
    async fn remove_all(&self, table: Table, repository: &str) -> DepotResult<u64>;

    /// Records ordered by id, starting strictly after `after`
    async fn scan(
        &self,
        table: Table,
        repository: &str,
        after: Option<&str>,
        limit: usize,
    ) -> DepotResult<Vec<Versioned>>;

    async fn count(&self, table: Table, repository: &str) -> DepotResult<u64>;
}

type Partition = BTreeMap<String, Versioned>;

/// Process-local record store
#[derive(Default)]
pub struct MemoryRecordStore {
    partitions: RwLock<HashMap<(Table, String), Partition>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(
        &self,
        table: Table,
        repository: &str,
        id: &str,
    ) -> DepotResult<Option<Versioned>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&(table, repository.to_string()))
            .and_then(|p| p.get(id))
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> DepotResult<WriteOutcome> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions
            .entry((table, repository.to_string()))
            .or_default();

        let current = partition.get(id).map(|r| r.generation);
        if current != expected {
            return Ok(WriteOutcome::Conflict { current });
        }

        let generation = current.map_or(1, |g| g + 1);
        partition.insert(
            id.to_string(),
            Versioned {
                id: id.to_string(),
                generation,
                value,
            },
        );
        Ok(WriteOutcome::Committed { generation })
    }

    async fn upsert(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        value: serde_json::Value,
    ) -> DepotResult<u64> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions
            .entry((table, repository.to_string()))
            .or_default();
        let generation = partition.get(id).map_or(1, |r| r.generation + 1);
        partition.insert(
            id.to_string(),
            Versioned {
                id: id.to_string(),
                generation,
                value,
            },
        );
        Ok(generation)
    }

    async fn remove(
        &self,
        table: Table,
        repository: &str,
        id: &str,
    ) -> DepotResult<Option<Versioned>> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .get_mut(&(table, repository.to_string()))
            .and_then(|p| p.remove(id)))
    }

    async fn remove_all(&self, table: Table, repository: &str) -> DepotResult<u64> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .remove(&(table, repository.to_string()))
            .map_or(0, |p| p.len() as u64))
    }

    async fn scan(
        &self,
        table: Table,
        repository: &str,
        after: Option<&str>,
        limit: usize,
    ) -> DepotResult<Vec<Versioned>> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(&(table, repository.to_string())) else {
            return Ok(vec![]);
        };

        let records = match after {
            Some(after) => partition
                .range::<str, _>((
                    std::ops::Bound::Excluded(after),
                    std::ops::Bound::Unbounded,
                ))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => partition.values().take(limit).cloned().collect(),
        };
        Ok(records)
    }

    async fn count(&self, table: Table, repository: &str) -> DepotResult<u64> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&(table, repository.to_string()))
            .map_or(0, |p| p.len() as u64))
    }
}

/// Longest id stored under its own hex encoding; longer ids get a
/// truncated prefix plus a digest
const MAX_INLINE_ID: usize = 100;

/// Record store keeping one JSON file per record:
/// `<root>/<table>/<repository>/<hex(id)>.json`
///
/// File names sort the same way as ids, so a page is served by listing the
/// directory and reading only the records on that page. Ids longer than
/// [`MAX_INLINE_ID`] bytes are named `<hex(prefix)>~<digest>.json` and
/// their id is read back from the file.
///
/// Writes are serialized by a process-wide mutex, so this backend is only
/// safe for a single node.
pub struct FileRecordStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// A directory entry and the id it holds
struct Entry {
    id: String,
    path: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn partition_dir(&self, table: Table, repository: &str) -> PathBuf {
        self.root.join(table.dir_name()).join(repository)
    }

    fn file_name(id: &str) -> String {
        let bytes = id.as_bytes();
        if bytes.len() <= MAX_INLINE_ID {
            return format!("{}.json", hex::encode(bytes));
        }
        let digest = Sha256::digest(bytes);
        format!(
            "{}~{}.json",
            hex::encode(&bytes[..MAX_INLINE_ID]),
            hex::encode(&digest[..16])
        )
    }

    fn record_path(&self, table: Table, repository: &str, id: &str) -> PathBuf {
        self.partition_dir(table, repository)
            .join(Self::file_name(id))
    }

    /// Id encoded in a file stem, when it was short enough to be inlined
    fn inline_id(stem: &str) -> Option<String> {
        if stem.contains('~') {
            return None;
        }
        hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok())
    }

    async fn read_record(path: &Path) -> DepotResult<Option<Versioned>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let record = serde_json::from_str(&content).map_err(|e| {
                    DepotError::storage(format!("decoding record {}", path.display()), e)
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DepotError::storage(
                format!("reading record {}", path.display()),
                e,
            )),
        }
    }

    /// Record files of a partition, without their ids
    async fn list_files(&self, table: Table, repository: &str) -> DepotResult<Vec<PathBuf>> {
        let dir = self.partition_dir(table, repository);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(DepotError::storage(
                    format!("listing {}", dir.display()),
                    e,
                ))
            }
        };

        let mut files = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DepotError::storage(format!("listing {}", dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Ids of a partition in order. Only records with digest names are
    /// opened.
    async fn list_entries(&self, table: Table, repository: &str) -> DepotResult<Vec<Entry>> {
        let mut entries = vec![];
        for path in self.list_files(table, repository).await? {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let id = match Self::inline_id(stem) {
                Some(id) => id,
                None => match Self::read_record(&path).await? {
                    Some(record) => record.id,
                    None => continue,
                },
            };
            entries.push(Entry { id, path });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn write_record(
        &self,
        table: Table,
        repository: &str,
        path: &Path,
        record: &Versioned,
    ) -> DepotResult<()> {
        let content = serde_json::to_vec(record)?;

        let dir = self.partition_dir(table, repository);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DepotError::storage(format!("creating {}", dir.display()), e))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| DepotError::storage(format!("writing record {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| DepotError::storage(format!("committing record {}", path.display()), e))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(
        &self,
        table: Table,
        repository: &str,
        id: &str,
    ) -> DepotResult<Option<Versioned>> {
        Self::read_record(&self.record_path(table, repository, id)).await
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> DepotResult<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(table, repository, id);

        let current = Self::read_record(&path).await?.map(|r| r.generation);
        if current != expected {
            return Ok(WriteOutcome::Conflict { current });
        }

        let generation = current.map_or(1, |g| g + 1);
        let record = Versioned {
            id: id.to_string(),
            generation,
            value,
        };
        self.write_record(table, repository, &path, &record).await?;
        Ok(WriteOutcome::Committed { generation })
    }

    async fn upsert(
        &self,
        table: Table,
        repository: &str,
        id: &str,
        value: serde_json::Value,
    ) -> DepotResult<u64> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(table, repository, id);
        let generation = Self::read_record(&path)
            .await?
            .map_or(1, |r| r.generation + 1);
        let record = Versioned {
            id: id.to_string(),
            generation,
            value,
        };
        self.write_record(table, repository, &path, &record).await?;
        Ok(generation)
    }

    async fn remove(
        &self,
        table: Table,
        repository: &str,
        id: &str,
    ) -> DepotResult<Option<Versioned>> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(table, repository, id);
        let existing = Self::read_record(&path).await?;
        if existing.is_some() {
            fs::remove_file(&path).await.map_err(|e| {
                DepotError::storage(format!("deleting record {}", path.display()), e)
            })?;
        }
        Ok(existing)
    }

    async fn remove_all(&self, table: Table, repository: &str) -> DepotResult<u64> {
        let _guard = self.write_lock.lock().await;
        let count = self.list_files(table, repository).await?.len() as u64;
        let dir = self.partition_dir(table, repository);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(DepotError::storage(
                format!("deleting {}", dir.display()),
                e,
            )),
        }
    }

    async fn scan(
        &self,
        table: Table,
        repository: &str,
        after: Option<&str>,
        limit: usize,
    ) -> DepotResult<Vec<Versioned>> {
        let entries = self.list_entries(table, repository).await?;
        let mut records = Vec::with_capacity(limit.min(entries.len()));
        for entry in entries
            .into_iter()
            .filter(|e| after.map_or(true, |after| e.id.as_str() > after))
            .take(limit)
        {
            // Removed between listing and reading
            if let Some(record) = Self::read_record(&entry.path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn count(&self, table: Table, repository: &str) -> DepotResult<u64> {
        Ok(self.list_files(table, repository).await?.len() as u64)
    }
}
