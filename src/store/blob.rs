//! Blob backends
//!
//! The content store only ever holds a [`BlobRef`] handle. Blobs are
//! append-mostly: a new payload generation is always a new blob, and the
//! previous one is handed to the external collector instead of being
//! overwritten.
//!
//! Large payloads move through [`BlobStore::put_reader`] and
//! [`BlobStore::open`] so they are never held in memory whole. The digest
//! and size are computed while the bytes are copied.

use crate::error::{DepotError, DepotResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Blocking reader over a payload
pub type BlobReader = Box<dyn Read + Send>;

/// Outcome of a streamed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub blob: BlobRef,
    pub size_bytes: u64,
    /// Hex SHA-256 of the bytes written
    pub content_hash: String,
}

/// Writer that hashes and counts what passes through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, u64, String) {
        (self.inner, self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer`, returning the writer, size and digest
fn hashing_copy<W: Write>(mut reader: impl Read, writer: W) -> io::Result<(W, u64, String)> {
    let mut hashing = HashingWriter::new(writer);
    io::copy(&mut reader, &mut hashing)?;
    hashing.flush()?;
    Ok(hashing.finish())
}

fn join_error(e: tokio::task::JoinError) -> DepotError {
    DepotError::Internal(format!("blob task failed: {}", e))
}

/// Opaque handle into a blob store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Generate a fresh, unique reference
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque byte store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a new reference
    async fn put(&self, bytes: Bytes) -> DepotResult<BlobRef>;

    /// Store everything `reader` yields under a new reference
    async fn put_reader(&self, reader: BlobReader) -> DepotResult<WrittenBlob>;

    /// Read a blob; `None` when the blob no longer exists
    async fn get(&self, blob: &BlobRef) -> DepotResult<Option<Bytes>>;

    /// Open a blob for streaming; `None` when the blob no longer exists
    async fn open(&self, blob: &BlobRef) -> DepotResult<Option<BlobReader>>;

    /// Delete a blob, returning whether it existed
    async fn delete(&self, blob: &BlobRef) -> DepotResult<bool>;
}

/// In-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobRef, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Bytes) -> DepotResult<BlobRef> {
        let blob = BlobRef::generate();
        self.blobs.write().await.insert(blob.clone(), bytes);
        Ok(blob)
    }

    async fn put_reader(&self, reader: BlobReader) -> DepotResult<WrittenBlob> {
        let (buffer, size_bytes, content_hash) =
            tokio::task::spawn_blocking(move || hashing_copy(reader, Vec::new()))
                .await
                .map_err(join_error)?
                .map_err(|e| DepotError::storage("buffering blob", e))?;
        let blob = self.put(Bytes::from(buffer)).await?;
        Ok(WrittenBlob {
            blob,
            size_bytes,
            content_hash,
        })
    }

    async fn get(&self, blob: &BlobRef) -> DepotResult<Option<Bytes>> {
        Ok(self.blobs.read().await.get(blob).cloned())
    }

    async fn open(&self, blob: &BlobRef) -> DepotResult<Option<BlobReader>> {
        Ok(self
            .get(blob)
            .await?
            .map(|bytes| Box::new(io::Cursor::new(bytes)) as BlobReader))
    }

    async fn delete(&self, blob: &BlobRef) -> DepotResult<bool> {
        Ok(self.blobs.write().await.remove(blob).is_some())
    }
}

/// Blob store backed by a directory tree: `<root>/<ab>/<ref>.blob`
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let name = blob.as_str();
        let shard = name.get(..2).unwrap_or("00");
        self.root.join(shard).join(format!("{}.blob", name))
    }

    fn tmp_path(&self, blob: &BlobRef) -> PathBuf {
        self.root.join("tmp").join(format!("{}.part", blob))
    }

    async fn prepare_dirs(&self, path: &Path) -> DepotResult<()> {
        let tmp_dir = self.root.join("tmp");
        for dir in [path.parent(), Some(tmp_dir.as_path())].into_iter().flatten() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| DepotError::storage(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}

/// Stream `reader` into `tmp`, then move it to `path`. The partial file is
/// removed when the copy fails.
fn write_streamed(reader: BlobReader, tmp: &Path, path: &Path) -> io::Result<(u64, String)> {
    let copied = std::fs::File::create(tmp)
        .and_then(|file| hashing_copy(reader, io::BufWriter::new(file)))
        .and_then(|(writer, size, digest)| {
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok((size, digest))
        });
    match copied {
        Ok(done) => {
            std::fs::rename(tmp, path)?;
            Ok(done)
        }
        Err(e) => {
            let _ = std::fs::remove_file(tmp);
            Err(e)
        }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, bytes: Bytes) -> DepotResult<BlobRef> {
        let blob = BlobRef::generate();
        let path = self.blob_path(&blob);
        let tmp = self.tmp_path(&blob);
        self.prepare_dirs(&path).await?;

        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| DepotError::storage(format!("writing blob {}", blob), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| DepotError::storage(format!("committing blob {}", blob), e))?;

        Ok(blob)
    }

    async fn put_reader(&self, reader: BlobReader) -> DepotResult<WrittenBlob> {
        let blob = BlobRef::generate();
        let path = self.blob_path(&blob);
        let tmp = self.tmp_path(&blob);
        self.prepare_dirs(&path).await?;

        let (size_bytes, content_hash) =
            tokio::task::spawn_blocking(move || write_streamed(reader, &tmp, &path))
                .await
                .map_err(join_error)?
                .map_err(|e| DepotError::storage(format!("writing blob {}", blob), e))?;

        Ok(WrittenBlob {
            blob,
            size_bytes,
            content_hash,
        })
    }

    async fn get(&self, blob: &BlobRef) -> DepotResult<Option<Bytes>> {
        match fs::read(self.blob_path(blob)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DepotError::storage(format!("reading blob {}", blob), e)),
        }
    }

    async fn open(&self, blob: &BlobRef) -> DepotResult<Option<BlobReader>> {
        match fs::File::open(self.blob_path(blob)).await {
            Ok(file) => {
                let file = file.into_std().await;
                Ok(Some(Box::new(io::BufReader::new(file)) as BlobReader))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DepotError::storage(format!("opening blob {}", blob), e)),
        }
    }

    async fn delete(&self, blob: &BlobRef) -> DepotResult<bool> {
        match fs::remove_file(self.blob_path(blob)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DepotError::storage(format!("deleting blob {}", blob), e)),
        }
    }
}
