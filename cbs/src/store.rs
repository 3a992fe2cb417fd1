//! SQLite-backed record store
//!
//! Records are stored as JSON documents in a single `records` table,
//! namespaced by collection. Indexed fields declared by each Record get
//! rows in `record_indexes` so filtered list/count queries stay off the
//! JSON blobs. One process at a time may open the store writable; a
//! sidecar lock file enforces that.

use eyre::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::record::{Filter, IndexValue, Record};

/// Default store location: `{data_local_dir}/callbackd/store.db`
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("callbackd")
        .join("store.db")
}

/// Per-collection record counts, for the inspection CLI
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub collection: String,
    pub records: u64,
}

/// The record store
pub struct Store {
    conn: Connection,
    path: PathBuf,
    /// Held for the lifetime of a writable store; releases on drop
    lock_file: Option<File>,
}

impl Store {
    /// Open or create a writable store at the given path
    ///
    /// Takes an exclusive advisory lock; a second writable open of the
    /// same path fails until the first store is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let lock_path = lock_path_for(&path);
        let lock_file = File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        fs2::FileExt::try_lock_exclusive(&lock_file)
            .with_context(|| format!("Store is locked by another process: {}", path.display()))?;

        let conn = Connection::open(&path).with_context(|| format!("Failed to open store: {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        init_schema(&conn)?;

        debug!(path = %path.display(), "Opened store (writable)");
        Ok(Self {
            conn,
            path,
            lock_file: Some(lock_file),
        })
    }

    /// Open an existing store read-only, without taking the writer lock
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)
            .with_context(|| format!("Failed to open store read-only: {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        debug!(path = %path.display(), "Opened store (read-only)");
        Ok(Self {
            conn,
            path,
            lock_file: None,
        })
    }

    /// Path this store was opened at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new record, returning its id
    ///
    /// Fails if a record with the same id already exists in the collection.
    pub fn create<T: Record + Serialize>(&mut self, record: T) -> Result<String> {
        let collection = T::collection_name();
        let id = record.id().to_string();
        let data = serde_json::to_string(&record)?;
        let fields = record.indexed_fields();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![collection, id, data, record.updated_at()],
        )
        .with_context(|| format!("Failed to create record {} in {}", id, collection))?;
        write_index_rows(&tx, collection, &id, &fields)?;
        tx.commit()?;

        debug!(collection, record_id = %id, "Created record");
        Ok(id)
    }

    /// Fetch a record by id
    pub fn get<T: Record + DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let collection = T::collection_name();
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => {
                let record = serde_json::from_str(&data)
                    .with_context(|| format!("Failed to deserialize record {} in {}", id, collection))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Replace an existing record and refresh its index rows
    pub fn update<T: Record + Serialize>(&mut self, record: T) -> Result<()> {
        let collection = T::collection_name();
        let id = record.id().to_string();
        let data = serde_json::to_string(&record)?;
        let fields = record.indexed_fields();

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE records SET data = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![collection, id, data, record.updated_at()],
        )?;
        if changed == 0 {
            bail!("Record not found: {} in {}", id, collection);
        }
        write_index_rows(&tx, collection, &id, &fields)?;
        tx.commit()?;

        debug!(collection, record_id = %id, "Updated record");
        Ok(())
    }

    /// Delete a record and its index rows; deleting a missing id is a no-op
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<()> {
        let collection = T::collection_name();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND record_id = ?2",
            params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.commit()?;

        debug!(collection, record_id = %id, "Deleted record");
        Ok(())
    }

    /// List records matching every filter, oldest update first
    pub fn list<T: Record + DeserializeOwned>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        let collection = T::collection_name();
        let rows = self.select_data(collection, filters)?;
        let mut records = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            let record = serde_json::from_str(&data)
                .with_context(|| format!("Failed to deserialize record {} in {}", id, collection))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Count records matching every filter without deserializing them
    pub fn count<T: Record>(&self, filters: &[Filter]) -> Result<u64> {
        let collection = T::collection_name();
        if filters.is_empty() {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?;
            return Ok(n as u64);
        }
        Ok(self.matching_ids(collection, filters)?.len() as u64)
    }

    /// Rebuild all index rows for a record type from stored data
    ///
    /// Run at startup so index queries stay correct across schema changes
    /// to `indexed_fields()`. Returns the number of records reindexed.
    pub fn rebuild_indexes<T: Record + DeserializeOwned>(&mut self) -> Result<usize> {
        let collection = T::collection_name();
        let rows = self.select_data(collection, &[])?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM record_indexes WHERE collection = ?1", params![collection])?;
        let mut count = 0usize;
        for (id, data) in rows {
            let record: T = serde_json::from_str(&data)
                .with_context(|| format!("Failed to deserialize record {} in {}", id, collection))?;
            write_index_rows(&tx, collection, &id, &record.indexed_fields())?;
            count += 1;
        }
        tx.commit()?;

        info!(collection, count, "Rebuilt indexes");
        Ok(count)
    }

    /// Names and record counts of every collection present
    pub fn collections(&self) -> Result<Vec<CollectionStats>> {
        let mut stmt = self
            .conn
            .prepare("SELECT collection, COUNT(*) FROM records GROUP BY collection ORDER BY collection")?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionStats {
                collection: row.get(0)?,
                records: row.get::<_, i64>(1)? as u64,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Ids and update timestamps in a collection, for the inspection CLI
    pub fn list_ids(&self, collection: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, updated_at FROM records WHERE collection = ?1 ORDER BY updated_at, id")?;
        let rows = stmt.query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Raw JSON value of a record, for the inspection CLI
    pub fn get_raw(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Record ids in the collection that satisfy the intersection of filters
    fn matching_ids(&self, collection: &str, filters: &[Filter]) -> Result<HashSet<String>> {
        let mut matched: Option<HashSet<String>> = None;
        for filter in filters {
            let ids = self.candidate_ids(collection, filter)?;
            matched = Some(match matched {
                None => ids,
                Some(prev) => prev.intersection(&ids).cloned().collect(),
            });
            if matched.as_ref().is_some_and(|m| m.is_empty()) {
                break;
            }
        }
        Ok(matched.unwrap_or_default())
    }

    /// Record ids with an index row satisfying a single filter
    fn candidate_ids(&self, collection: &str, filter: &Filter) -> Result<HashSet<String>> {
        let column = match filter.value {
            IndexValue::String(_) => "value_text",
            IndexValue::Integer(_) => "value_int",
        };
        let sql = format!(
            "SELECT record_id FROM record_indexes WHERE collection = ?1 AND field = ?2 AND {} {} ?3",
            column,
            filter.op.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut ids = HashSet::new();
        match &filter.value {
            IndexValue::String(s) => {
                let rows = stmt.query_map(params![collection, filter.field, s], |row| row.get::<_, String>(0))?;
                for id in rows {
                    ids.insert(id?);
                }
            }
            IndexValue::Integer(i) => {
                let rows = stmt.query_map(params![collection, filter.field, i], |row| row.get::<_, String>(0))?;
                for id in rows {
                    ids.insert(id?);
                }
            }
        }
        Ok(ids)
    }

    /// (id, data) pairs for a collection, filtered, oldest update first
    fn select_data(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, String)>> {
        if filters.is_empty() {
            let mut stmt = self
                .conn
                .prepare("SELECT id, data FROM records WHERE collection = ?1 ORDER BY updated_at, id")?;
            let rows = stmt.query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?;
            return rows.collect::<Result<Vec<_>, _>>().map_err(Into::into);
        }

        let ids = self.matching_ids(collection, filters)?;
        let mut stmt = self
            .conn
            .prepare("SELECT data, updated_at FROM records WHERE collection = ?1 AND id = ?2")?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let found: Option<(String, i64)> = stmt
                .query_row(params![collection, &id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            if let Some((data, updated_at)) = found {
                rows.push((updated_at, id, data));
            }
        }
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(rows.into_iter().map(|(_, id, data)| (id, data)).collect())
    }
}

/// Sidecar lock path for a store file
fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );
        CREATE TABLE IF NOT EXISTS record_indexes (
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            field TEXT NOT NULL,
            value_text TEXT,
            value_int INTEGER,
            PRIMARY KEY (collection, record_id, field)
        );
        CREATE INDEX IF NOT EXISTS idx_record_indexes_text
            ON record_indexes (collection, field, value_text);
        CREATE INDEX IF NOT EXISTS idx_record_indexes_int
            ON record_indexes (collection, field, value_int);",
    )?;
    Ok(())
}

fn write_index_rows(
    tx: &rusqlite::Transaction<'_>,
    collection: &str,
    record_id: &str,
    fields: &HashMap<String, IndexValue>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND record_id = ?2",
        params![collection, record_id],
    )?;
    for (field, value) in fields {
        match value {
            IndexValue::String(s) => tx.execute(
                "INSERT INTO record_indexes (collection, record_id, field, value_text, value_int)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![collection, record_id, field, s],
            )?,
            IndexValue::Integer(i) => tx.execute(
                "INSERT INTO record_indexes (collection, record_id, field, value_text, value_int)
                 VALUES (?1, ?2, ?3, NULL, ?4)",
                params![collection, record_id, field, i],
            )?,
        };
    }
    Ok(())
}
