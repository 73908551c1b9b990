//! # Durable Store
//!
//! Single-file SQLite persistence in WAL mode. One writer connection is the
//! serialization lane for all mutations; a small pool of reader connections
//! serves queries in parallel (WAL readers never block the writer).
//!
//! Durability policy: provider mutations commit with `synchronous=FULL`;
//! log and counter batches ride the default `NORMAL`, which survives abrupt
//! termination without corruption at the cost of possibly losing the last
//! batch. The WAL is checkpointed on shutdown.
//!
//! All public methods are async; the blocking SQLite work runs on the
//! runtime's blocking pool.

mod keys;
mod logs;
mod providers;
mod schema;

use crate::error::StoreError;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const READ_POOL_SIZE: usize = 4;

/// Handle to the gateway's single database file. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path`, apply pragmas and
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let writer = Connection::open(&path)?;
        writer.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA foreign_keys=ON;",
        )?;
        schema::run_migrations(&writer)?;

        let mut readers = Vec::with_capacity(READ_POOL_SIZE);
        for _ in 0..READ_POOL_SIZE {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
            readers.push(Mutex::new(conn));
        }

        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a mutation on the write lane.
    pub(crate) async fn with_writer<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = writer.lock();
            f(&mut conn)
        })
        .await
        .map_err(|_| StoreError::WorkerGone)?
    }

    /// Run a mutation on the write lane with fully synchronous commits, for
    /// provider-table changes that must survive power loss.
    pub(crate) async fn with_writer_durable<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        self.with_writer(move |conn| {
            conn.execute_batch("PRAGMA synchronous=FULL;")?;
            let result = f(conn);
            conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
            result
        })
        .await
    }

    /// Run a query on one of the reader connections.
    pub(crate) async fn with_reader<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let readers = self.readers.clone();
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let conn = readers[idx].lock();
            f(&conn)
        })
        .await
        .map_err(|_| StoreError::WorkerGone)?
    }

    /// Flush the WAL back into the main file. Called on shutdown.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        self.with_writer(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;
    use tempfile::TempDir;

    /// A store on a throwaway database file. The directory guard must stay
    /// alive for the store's lifetime.
    pub fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path().join("hermes.db")).expect("open store");
        (dir, store)
    }
}
