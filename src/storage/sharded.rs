//! # Sharded-File Backend
//!
//! One file per key. The key's hex rendering is split into a directory
//! prefix and a file name:
//!
//! ```text
//! key  0190a3f2c1d4 7e3a8b...      (hex, big-endian)
//!      └──┬───┘└───────┬────────┘
//!       prefix      remainder
//!
//! root/0190a3/f2c1d47e3a8b...
//! ```
//!
//! With a six-digit prefix a v7 identifier opens a new directory every
//! 2^24 ms (about 4.7 hours), which keeps per-directory fan-out bounded.
//!
//! ## Writes
//!
//! Each record is encoded into a pooled buffer, written to `<name>.tmp`,
//! synced, then renamed into place. Readers never see a partial record. All
//! writes go through one async mutex.
//!
//! ## Reads
//!
//! Prefix directories in sorted order, then files in sorted order. Hex order
//! of equal-width big-endian keys is byte order, so v7 keys come back in
//! generation order.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{check_batch_keys, AppendStorage, KeyFn, StorageItem, StorageKey};
use crate::codec::{from_slice, Serializer};
use crate::error::{Error, Result};
use crate::id::Identifier;

/// Hex digits of the key used as the directory name.
pub const PREFIX_LEN: usize = 6;

/// Suffix of in-flight writes.
const TEMP_SUFFIX: &str = "tmp";

// =============================================================================
// Storage
// =============================================================================

/// Directory-sharded file-per-key storage.
pub struct ShardedFileStorage<T, K = Identifier> {
    root: PathBuf,
    key_of: KeyFn<T, K>,
    writer: Mutex<Serializer>,
    closed: AtomicBool,
}

impl<T: StorageItem, K: StorageKey> ShardedFileStorage<T, K> {
    /// Opens (creating if needed) storage rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, key_of: KeyFn<T, K>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), item = T::TYPE_NAME, "opened sharded file storage");
        Ok(Self {
            root,
            key_of,
            writer: Mutex::new(Serializer::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the record for `key` lives.
    pub fn path_for(&self, key: &K) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..PREFIX_LEN]).join(&hex[PREFIX_LEN..])
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

async fn write_record(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension(TEMP_SUFFIX);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl<T: StorageItem, K: StorageKey> AppendStorage<T, K> for ShardedFileStorage<T, K> {
    async fn append(&self, item: &T) -> Result<()> {
        self.ensure_open()?;
        let key = (self.key_of)(item);
        let path = self.path_for(&key);

        let mut serializer = self.writer.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::DuplicateKey { key: key.to_hex() });
        }
        let bytes = serializer.to_vec(item)?;
        write_record(&path, &bytes).await?;
        debug!(key = %key.to_hex(), len = bytes.len(), "appended record");
        Ok(())
    }

    async fn append_batch(&self, items: &[T]) -> Result<()> {
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(());
        }
        let keys: Vec<K> = items.iter().map(self.key_of).collect();
        check_batch_keys(&keys)?;

        let mut serializer = self.writer.lock().await;
        let mut records = Vec::with_capacity(items.len());
        for (item, key) in items.iter().zip(&keys) {
            let path = self.path_for(key);
            if tokio::fs::try_exists(&path).await? {
                return Err(Error::DuplicateKey { key: key.to_hex() });
            }
            records.push((path, serializer.to_vec(item)?));
        }

        for (index, (path, bytes)) in records.iter().enumerate() {
            if let Err(err) = write_record(path, bytes).await {
                // Undo the part of the batch already in place.
                for (written, _) in &records[..index] {
                    let _ = tokio::fs::remove_file(written).await;
                }
                return Err(err);
            }
        }
        debug!(count = items.len(), "appended batch");
        Ok(())
    }

    fn get_all(&self, from: Option<K>) -> BoxStream<'_, Result<T>> {
        if let Err(err) = self.ensure_open() {
            return stream::once(async move { Err(err) }).boxed();
        }
        let scan = ShardScan {
            root: self.root.clone(),
            from_hex: from.map(|k| k.to_hex()),
            dirs: None,
            files: VecDeque::new(),
            key_hex_len: K::LEN * 2,
        };
        stream::try_unfold(scan, |mut scan| async move {
            match scan.next_file().await? {
                Some(path) => {
                    let bytes = tokio::fs::read(&path).await?;
                    let item = from_slice::<T>(&bytes)?;
                    Ok(Some((item, scan)))
                }
                None => Ok(None),
            }
        })
        .boxed()
    }

    async fn flush(&self) -> Result<()> {
        // Every append is synced before it returns.
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.closed.store(true, Ordering::Release);
        debug!(root = %self.root.display(), "closed sharded file storage");
        Ok(())
    }
}

// =============================================================================
// Directory Scan
// =============================================================================

struct ShardScan {
    root: PathBuf,
    from_hex: Option<String>,
    dirs: Option<VecDeque<String>>,
    files: VecDeque<PathBuf>,
    key_hex_len: usize,
}

impl ShardScan {
    async fn next_file(&mut self) -> Result<Option<PathBuf>> {
        loop {
            if let Some(path) = self.files.pop_front() {
                return Ok(Some(path));
            }
            if self.dirs.is_none() {
                self.dirs = Some(self.list_dirs().await?);
            }
            let Some(dir) = self.dirs.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            self.files = self.list_files(&dir).await?;
        }
    }

    async fn list_dirs(&self) -> Result<VecDeque<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
            Err(e) => return Err(e.into()),
        };
        let min_prefix = self.from_hex.as_deref().map(|h| &h[..PREFIX_LEN]);

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.len() != PREFIX_LEN || !is_lower_hex(&name) {
                continue;
            }
            if min_prefix.is_some_and(|min| name.as_str() < min) {
                continue;
            }
            dirs.push(name);
        }
        dirs.sort_unstable();
        Ok(dirs.into())
    }

    async fn list_files(&self, dir: &str) -> Result<VecDeque<PathBuf>> {
        let dir_path = self.root.join(dir);
        let mut entries = tokio::fs::read_dir(&dir_path).await?;
        let remainder_len = self.key_hex_len - PREFIX_LEN;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if name.ends_with(TEMP_SUFFIX) {
                warn!(path = %dir_path.join(&name).display(), "skipping leftover temp file");
                continue;
            }
            if name.len() != remainder_len || !is_lower_hex(&name) {
                continue;
            }
            if let Some(from) = &self.from_hex {
                let full = format!("{dir}{name}");
                if full.as_str() < from.as_str() {
                    continue;
                }
            }
            names.push(name);
        }
        names.sort_unstable();
        Ok(names.into_iter().map(|name| dir_path.join(name)).collect())
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// =============================================================================
// Tests
// =============================================================================
