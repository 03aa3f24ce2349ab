use std::path::Path;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{EtlError, Result};

pub mod diff;
pub mod hash;
pub mod id_map;
pub mod metadata;

/// Reserved alias the previous snapshot is attached under.
pub const PREVIOUS_SCHEMA: &str = "previous";

/// Transactional commits happen at batch granularity, every this many chunks.
pub const COMMIT_EVERY_CHUNKS: usize = 5;

/// Owns the single-file snapshot database for one pipeline run. Concurrent
/// writers are not supported; the file belongs to this run until publication.
pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    /// Opens the snapshot file with bulk-load tuning applied: large pages,
    /// write-ahead journaling, fsyncs off, enlarged page cache and mmap
    /// region, auto-vacuum and foreign-key enforcement disabled. Call
    /// [SnapshotStore::finish_bulk_load] once the snapshot is fully
    /// populated to restore safe defaults and run the constraint check.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::apply_bulk_tuning(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::apply_bulk_tuning(&conn)?;
        Ok(Self { conn })
    }

    fn apply_bulk_tuning(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA page_size = 8192;
             PRAGMA auto_vacuum = NONE;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = OFF;
             PRAGMA foreign_keys = OFF;
             PRAGMA cache_size = -1000000;
             PRAGMA mmap_size = 4294967296;",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Restores durability settings, re-enables foreign keys and runs the
    /// deferred constraint check over the fully loaded snapshot.
    pub fn finish_bulk_load(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let violations = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !violations.is_empty() {
            return Err(EtlError::DataIntegrity(format!(
                "foreign key violations after load in tables {violations:?}"
            )));
        }
        Ok(())
    }

    /// Flushes the write-ahead log into the main database file so the file
    /// on disk is the complete snapshot before upload.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    pub fn attach_previous(&self, path: &Path) -> Result<()> {
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {PREVIOUS_SCHEMA}"),
            params![path.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }

    pub fn detach_previous(&self) -> Result<()> {
        self.conn
            .execute(&format!("DETACH DATABASE {PREVIOUS_SCHEMA}"), [])?;
        Ok(())
    }

    /// Copies every row of the attached `previous.<source>` table into the
    /// local `target` table.
    pub fn load_previous_rows(&self, source: &str, target: &str) -> Result<usize> {
        info!("Loading {source} from the previous snapshot into {target}");
        let copied = self.conn.execute(
            &format!("INSERT INTO {target} SELECT * FROM {PREVIOUS_SCHEMA}.{source}"),
            [],
        )?;
        Ok(copied)
    }
}

/// Groups batched inserts into explicit transactions, committing every
/// `commit_every` batches instead of autocommitting each statement.
pub struct BatchCommitter<'c> {
    conn: &'c Connection,
    commit_every: usize,
    pending: usize,
    in_transaction: bool,
}

impl<'c> BatchCommitter<'c> {
    pub fn new(conn: &'c Connection, commit_every: usize) -> Self {
        Self {
            conn,
            commit_every,
            pending: 0,
            in_transaction: false,
        }
    }

    /// Call before writing a batch; opens a transaction if none is active.
    pub fn ensure_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Call after each batch; commits once enough batches have accumulated.
    pub fn batch_done(&mut self) -> Result<()> {
        self.pending += 1;
        if self.pending >= self.commit_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
            self.pending = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_copy_detach_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let previous_path = dir.path().join("previous.db");
        {
            let previous = SnapshotStore::open(&previous_path).unwrap();
            previous
                .conn()
                .execute_batch(
                    "CREATE TABLE address_current (id TEXT, address_pid TEXT);
                     INSERT INTO address_current VALUES ('h1', '100'), ('h2', '101');",
                )
                .unwrap();
            previous.checkpoint().unwrap();
        }

        let store = SnapshotStore::open(&dir.path().join("current.db")).unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE address_previous (id TEXT, address_pid TEXT);")
            .unwrap();
        store.attach_previous(&previous_path).unwrap();
        let copied = store
            .load_previous_rows("address_current", "address_previous")
            .unwrap();
        store.detach_previous().unwrap();
        assert_eq!(copied, 2);

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM address_previous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn finish_bulk_load_reports_orphans() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store
            .conn()
            .execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY);
                 CREATE TABLE child (id INTEGER, parent_id INTEGER,
                     FOREIGN KEY (parent_id) REFERENCES parent(id));
                 INSERT INTO child VALUES (1, 99);",
            )
            .unwrap();
        let result = store.finish_bulk_load();
        assert!(matches!(result, Err(EtlError::DataIntegrity(_))));
    }

    #[test]
    fn batch_committer_commits_every_n_batches() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store
            .conn()
            .execute_batch("CREATE TABLE t (v INTEGER)")
            .unwrap();
        let mut committer = BatchCommitter::new(store.conn(), 2);
        for value in 0..5 {
            committer.ensure_transaction().unwrap();
            store
                .conn()
                .execute("INSERT INTO t VALUES (?1)", params![value])
                .unwrap();
            committer.batch_done().unwrap();
        }
        committer.flush().unwrap();
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 5);
    }
}
