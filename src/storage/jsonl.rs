//! # JSON-Lines Backend
//!
//! A single UTF-8 file. The first line is a header written once, when the
//! file is created:
//!
//! ```text
//! {"Synqra.Storage.Jsonl":"1.0","rootItemType":"synqra.Event"}
//! {"$type":"commandCreated","eventId":"0190a3f2-...", ...}
//! {"$type":"objectCreated","eventId":"0190a3f2-...", ...}
//! ```
//!
//! Every later line is one item, camelCase JSON, `\n`-terminated and flushed
//! as soon as it is written. Appends are serialized by one async mutex.
//! Readers open their own handle.
//!
//! ## Cursors
//!
//! [`JsonlCursor::next`] returns `None` at end-of-file but may be called again
//! later: lines appended in the meantime are picked up where the cursor
//! stopped. A trailing line without its newline (a writer mid-write) is held
//! back until the newline arrives.
//!
//! The file has no index, so `get_all(from)` reads from the start and skips
//! items up to and including `from`.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AppendStorage, KeyFn, StorageItem, StorageKey};
use crate::error::{Error, Result};
use crate::id::Identifier;

/// Format version written into new files.
pub const FORMAT_VERSION: &str = "1.0";

/// Major version this build reads.
const FORMAT_MAJOR: &str = "1";

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "Synqra.Storage.Jsonl")]
    version: String,
    #[serde(rename = "rootItemType")]
    root_item_type: String,
}

impl Header {
    fn for_item<T: StorageItem>() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            root_item_type: T::TYPE_NAME.to_string(),
        }
    }

    fn parse_and_check<T: StorageItem>(line: &str, path: &Path) -> Result<Self> {
        let header: Header = serde_json::from_str(line).map_err(|e| {
            Error::Schema(format!("{} has no JSON-Lines header: {e}", path.display()))
        })?;
        let major = header.version.split('.').next().unwrap_or_default();
        if major != FORMAT_MAJOR {
            return Err(Error::Schema(format!(
                "{} has format version {}, this build reads {FORMAT_MAJOR}.x",
                path.display(),
                header.version
            )));
        }
        if header.root_item_type != T::TYPE_NAME {
            return Err(Error::Schema(format!(
                "{} stores '{}', expected '{}'",
                path.display(),
                header.root_item_type,
                T::TYPE_NAME
            )));
        }
        Ok(header)
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Append-only JSON-Lines file storage.
pub struct JsonlStorage<T, K = Identifier> {
    path: PathBuf,
    key_of: KeyFn<T, K>,
    writer: Mutex<File>,
    closed: AtomicBool,
}

impl<T: StorageItem, K: StorageKey> JsonlStorage<T, K> {
    /// Opens `path`, creating it with a header if it is missing or empty.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] if an existing file has a different major version or
    /// item type.
    pub async fn open(path: impl Into<PathBuf>, key_of: KeyFn<T, K>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        if file.metadata().await?.len() == 0 {
            let mut line = serde_json::to_string(&Header::for_item::<T>())?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            info!(path = %path.display(), item = T::TYPE_NAME, "created JSON-Lines storage");
        } else {
            let mut reader = BufReader::new(File::open(&path).await?);
            let mut first = String::new();
            reader.read_line(&mut first).await?;
            Header::parse_and_check::<T>(first.trim_end(), &path)?;
            info!(path = %path.display(), item = T::TYPE_NAME, "opened JSON-Lines storage");
        }

        Ok(Self {
            path,
            key_of,
            writer: Mutex::new(file),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A cursor over every item, which can be polled again after end-of-file.
    pub fn cursor(&self) -> JsonlCursor<T, K> {
        JsonlCursor::new(self.path.clone(), self.key_of, None)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn line_of(item: &T, out: &mut String) -> Result<()> {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
        Ok(())
    }
}

#[async_trait]
impl<T: StorageItem, K: StorageKey> AppendStorage<T, K> for JsonlStorage<T, K> {
    async fn append(&self, item: &T) -> Result<()> {
        self.ensure_open()?;
        let mut line = String::new();
        Self::line_of(item, &mut line)?;

        let mut file = self.writer.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(key = %(self.key_of)(item).to_hex(), "appended line");
        Ok(())
    }

    async fn append_batch(&self, items: &[T]) -> Result<()> {
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(());
        }
        super::check_batch_keys(&items.iter().map(self.key_of).collect::<Vec<_>>())?;
        let mut buffer = String::new();
        for item in items {
            Self::line_of(item, &mut buffer)?;
        }

        let mut file = self.writer.lock().await;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        debug!(count = items.len(), "appended lines");
        Ok(())
    }

    fn get_all(&self, from: Option<K>) -> BoxStream<'_, Result<T>> {
        if let Err(err) = self.ensure_open() {
            return stream::once(async move { Err(err) }).boxed();
        }
        let cursor = JsonlCursor::new(self.path.clone(), self.key_of, from);
        stream::try_unfold(cursor, |mut cursor| async move {
            Ok(cursor.next().await?.map(|item| (item, cursor)))
        })
        .boxed()
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let file = self.writer.lock().await;
        file.sync_data().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let file = self.writer.lock().await;
        if !self.closed.swap(true, Ordering::AcqRel) {
            file.sync_data().await?;
            debug!(path = %self.path.display(), "closed JSON-Lines storage");
        }
        Ok(())
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Resumable reader over a JSON-Lines file.
pub struct JsonlCursor<T, K = Identifier> {
    path: PathBuf,
    key_of: KeyFn<T, K>,
    after: Option<K>,
    reader: Option<BufReader<File>>,
    pending: String,
    header_checked: bool,
    line_no: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T: StorageItem, K: StorageKey> JsonlCursor<T, K> {
    fn new(path: PathBuf, key_of: KeyFn<T, K>, after: Option<K>) -> Self {
        Self {
            path,
            key_of,
            after,
            reader: None,
            pending: String::new(),
            header_checked: false,
            line_no: 0,
            _item: PhantomData,
        }
    }

    /// Next item, or `None` at the current end of the file.
    ///
    /// A missing file reads as empty. Calling again after `None` resumes.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if self.reader.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => self.reader = Some(BufReader::new(file)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            reader.read_line(&mut self.pending).await?;
            if !self.pending.ends_with('\n') {
                // End of file, possibly inside a line still being written.
                return Ok(None);
            }
            let line = std::mem::take(&mut self.pending);
            self.line_no += 1;
            let line = line.trim_end_matches(['\n', '\r']);

            if !self.header_checked {
                Header::parse_and_check::<T>(line, &self.path)?;
                self.header_checked = true;
                continue;
            }
            if line.trim().is_empty() {
                warn!(path = %self.path.display(), line = self.line_no, "skipping blank line");
                continue;
            }

            let item: T = serde_json::from_str(line).map_err(|e| {
                Error::Format(format!(
                    "{} line {}: {e}",
                    self.path.display(),
                    self.line_no
                ))
            })?;
            if let Some(after) = &self.after {
                if (self.key_of)(&item) <= *after {
                    continue;
                }
            }
            return Ok(Some(item));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
