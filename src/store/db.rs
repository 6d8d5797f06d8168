use crate::store::error::{Result, StoreError};
use crate::store::schema;
use log::debug;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the single durable database backing accounts, conversations,
/// and history.
///
/// One connection, serialized behind a mutex; every operation runs on the
/// blocking pool. The durable rows are the source of truth; in-memory
/// structures elsewhere are caches rebuilt from here.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database, applies pending migrations, and runs
    /// the post-migration fixups.
    pub async fn open(path: &str) -> Result<Self> {
        let path = path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let mut conn = Connection::open(&path)
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            // WAL returns a result row; plain execute would error out.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            schema::apply_migrations(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))??;

        debug!(target: "Store", "Database opened and migrated");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a closure against the connection on the blocking pool, with the
    /// connection lock held for the duration. Writers and readers alike
    /// serialize here.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
    }
}
