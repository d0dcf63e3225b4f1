//! # SQLite Backend
//!
//! One table per storage, keyed by the big-endian key bytes:
//!
//! ```text
//! synqra_metadata                    <table>   (WITHOUT ROWID)
//! ┌─────────────┬──────────────┐     ┌──────────────┬────────────┐
//! │ key (PK)    │ value        │     │ id BLOB (PK) │ data BLOB  │
//! ├─────────────┼──────────────┤     ├──────────────┼────────────┤
//! │ schema_     │ 1            │     │ 0190a3f2...  │ <binary>   │
//! │  version    │              │     │ 0190a3f3...  │ <binary>   │
//! │ <table>.    │ synqra.Event │     └──────────────┴────────────┘
//! │  item_type  │              │
//! └─────────────┴──────────────┘
//! ```
//!
//! SQLite compares BLOBs with `memcmp`, so the primary key order is the key
//! order and `ORDER BY id` is chronological for v7 identifiers.
//!
//! ## Connections
//!
//! File databases get a writer connection and a separate read-only reader
//! connection; WAL mode lets reads proceed while a batch commits. In-memory
//! databases share one connection. Every SQLite call runs on the blocking
//! pool.
//!
//! ## Reads
//!
//! `get_all` pages through the table: the first page is `id >= from`, every
//! later page is `id > <last id seen>`. Rows written after the first page is
//! fetched are picked up if their key sorts after the last row read.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use super::{check_batch_keys, join_error, AppendStorage, KeyFn, StorageItem, StorageKey};
use crate::codec::{from_slice, Serializer};
use crate::error::{Error, Result};
use crate::id::Identifier;

/// Current schema version of the metadata layout.
const SCHEMA_VERSION: i32 = 1;

/// Default number of rows fetched per read page.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Shared metadata table.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS synqra_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

fn create_items_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id   BLOB PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID"
    )
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest {
        return Err(Error::Argument(format!("invalid table name '{table}'")));
    }
    if table.eq_ignore_ascii_case("synqra_metadata") || table.starts_with("sqlite_") {
        return Err(Error::Argument(format!("table name '{table}' is reserved")));
    }
    Ok(())
}

// =============================================================================
// Schema Setup
// =============================================================================

fn initialize(conn: &Connection, table: &str, item_type: &str) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;

    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(&create_items_sql(table))?;

    verify_or_set(conn, "schema_version", &SCHEMA_VERSION.to_string())?;
    verify_or_set(conn, &format!("{table}.item_type"), item_type)?;
    Ok(())
}

/// Records `expected` under `key` on first use, and rejects a different
/// stored value afterwards.
fn verify_or_set(conn: &Connection, key: &str, expected: &str) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM synqra_metadata WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO synqra_metadata (key, value) VALUES (?1, ?2)",
                [key, expected],
            )?;
        }
        Some(value) if value == expected => {}
        Some(value) => {
            return Err(Error::Schema(format!(
                "metadata mismatch for '{key}': database has '{value}', expected '{expected}'"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Storage
// =============================================================================

/// SQLite-backed append storage.
pub struct SqliteStorage<T, K = Identifier> {
    path: Option<PathBuf>,
    table: Arc<str>,
    key_of: KeyFn<T, K>,
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    serializer: Mutex<Serializer>,
    page_size: usize,
    closed: Arc<AtomicBool>,
}

impl<T: StorageItem, K: StorageKey> SqliteStorage<T, K> {
    /// Opens (creating if needed) `table` in the database file at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Argument`] for a table name that is not a plain identifier
    /// - [`Error::Schema`] if the table was created for a different item type
    pub async fn open(
        path: impl Into<PathBuf>,
        table: &str,
        key_of: KeyFn<T, K>,
    ) -> Result<Self> {
        validate_table_name(table)?;
        let path = path.into();
        let table: Arc<str> = Arc::from(table);

        let (writer, reader) = {
            let path = path.clone();
            let table = Arc::clone(&table);
            tokio::task::spawn_blocking(move || -> Result<(Connection, Connection)> {
                let writer = Connection::open(&path)?;
                initialize(&writer, &table, T::TYPE_NAME)?;
                let reader = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                Ok((writer, reader))
            })
            .await
            .map_err(join_error)??
        };

        info!(path = %path.display(), table = %table, item = T::TYPE_NAME, "opened SQLite storage");
        Ok(Self::from_connections(
            Some(path),
            table,
            key_of,
            Arc::new(Mutex::new(writer)),
            Arc::new(Mutex::new(reader)),
        ))
    }

    /// Opens `table` in a private in-memory database.
    pub fn open_in_memory(table: &str, key_of: KeyFn<T, K>) -> Result<Self> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory()?;
        initialize(&conn, table, T::TYPE_NAME)?;
        let conn = Arc::new(Mutex::new(conn));
        Ok(Self::from_connections(
            None,
            Arc::from(table),
            key_of,
            Arc::clone(&conn),
            conn,
        ))
    }

    fn from_connections(
        path: Option<PathBuf>,
        table: Arc<str>,
        key_of: KeyFn<T, K>,
        writer: Arc<Mutex<Connection>>,
        reader: Arc<Mutex<Connection>>,
    ) -> Self {
        Self {
            path,
            table,
            key_of,
            writer,
            reader,
            serializer: Mutex::new(Serializer::new()),
            page_size: DEFAULT_PAGE_SIZE,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the number of rows fetched per read page (minimum 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Database file, or `None` for in-memory storage.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Table holding the items.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn encode_rows(&self, items: &[T]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut serializer = self.serializer.lock();
        items
            .iter()
            .map(|item| {
                let key = (self.key_of)(item).to_key_bytes();
                Ok((key, serializer.to_vec(item)?))
            })
            .collect()
    }

    async fn insert_rows(&self, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        let sql = format!("INSERT INTO {} (id, data) VALUES (?1, ?2)", self.table);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = writer.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for (key, data) in &rows {
                    stmt.execute(params![key, data])
                        .map_err(|e| Error::from_sqlite_insert(e, || hex::encode(key)))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl<T: StorageItem, K: StorageKey> AppendStorage<T, K> for SqliteStorage<T, K> {
    async fn append(&self, item: &T) -> Result<()> {
        self.ensure_open()?;
        let rows = self.encode_rows(std::slice::from_ref(item))?;
        self.insert_rows(rows).await?;
        debug!(table = %self.table, key = %(self.key_of)(item).to_hex(), "appended row");
        Ok(())
    }

    async fn append_batch(&self, items: &[T]) -> Result<()> {
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(());
        }
        check_batch_keys(&items.iter().map(self.key_of).collect::<Vec<_>>())?;
        let rows = self.encode_rows(items)?;
        self.insert_rows(rows).await?;
        debug!(table = %self.table, count = items.len(), "appended rows");
        Ok(())
    }

    fn get_all(&self, from: Option<K>) -> BoxStream<'_, Result<T>> {
        if let Err(err) = self.ensure_open() {
            return stream::once(async move { Err(err) }).boxed();
        }
        let pager = Pager {
            reader: Arc::clone(&self.reader),
            closed: Arc::clone(&self.closed),
            table: Arc::clone(&self.table),
            page_size: self.page_size,
            bound: from.map(|key| Bound::Inclusive(key.to_key_bytes())),
            rows: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(pager, |mut pager| async move {
            match pager.next_row().await? {
                Some(data) => Ok(Some((from_slice::<T>(&data)?, pager))),
                None => Ok(None),
            }
        })
        .boxed()
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if self.path.is_none() {
            return Ok(());
        }
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            writer
                .lock()
                .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(table = %self.table, "closed SQLite storage");
        }
        Ok(())
    }
}

// =============================================================================
// Paged Reads
// =============================================================================

enum Bound {
    Inclusive(Vec<u8>),
    Exclusive(Vec<u8>),
}

struct Pager {
    reader: Arc<Mutex<Connection>>,
    closed: Arc<AtomicBool>,
    table: Arc<str>,
    page_size: usize,
    bound: Option<Bound>,
    rows: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl Pager {
    async fn next_row(&mut self) -> Result<Option<Vec<u8>>> {
        if self.rows.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        match self.rows.pop_front() {
            Some((key, data)) => {
                self.bound = Some(Bound::Exclusive(key));
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let table = &self.table;
        let (sql, bound) = match self.bound.take() {
            None => (
                format!("SELECT id, data FROM {table} ORDER BY id LIMIT ?1"),
                None,
            ),
            Some(Bound::Inclusive(key)) => (
                format!("SELECT id, data FROM {table} WHERE id >= ?2 ORDER BY id LIMIT ?1"),
                Some(key),
            ),
            Some(Bound::Exclusive(key)) => (
                format!("SELECT id, data FROM {table} WHERE id > ?2 ORDER BY id LIMIT ?1"),
                Some(key),
            ),
        };
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        let reader = Arc::clone(&self.reader);

        let page = tokio::task::spawn_blocking(move || -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            let conn = reader.lock();
            let mut stmt = conn.prepare_cached(&sql)?;
            let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(Vec<u8>, Vec<u8>)> {
                Ok((row.get(0)?, row.get(1)?))
            };
            let rows = match &bound {
                Some(key) => stmt.query_map(params![limit, key], map)?,
                None => stmt.query_map(params![limit], map)?,
            };
            let page = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(page)
        })
        .await
        .map_err(join_error)??;

        self.exhausted = page.len() < self.page_size;
        self.rows.extend(page);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
