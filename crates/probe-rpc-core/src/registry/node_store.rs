//! SQLite-backed node store for the path registry.
//!
//! A single database file can be shared by every server on a host, so a
//! client process can read what a server process published. Ephemeral nodes
//! record the PID of their owner; once that process is gone the node is no
//! longer visible and is pruned on the next read.

use super::path::{split_parent, NodeMode, NodeStore};
use crate::config::RegistryDefaults;
use crate::error::{Result, RpcError};
use crate::platform::is_process_alive;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Turn a registry address (`sqlite://<file>` or a bare path) into a file path.
pub fn db_path_from_address(address: &str) -> PathBuf {
    PathBuf::from(address.strip_prefix("sqlite://").unwrap_or(address))
}

/// Node store persisted in a SQLite file.
///
/// Uses WAL mode for safe concurrent access across processes and
/// `Arc<Mutex<Connection>>` for thread safety within a process.
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
    owner_pid: u32,
}

impl SqliteNodeStore {
    /// Open the store at a specific path.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| RpcError::Io {
                    message: format!("Failed to create registry directory: {}", parent.display()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            owner_pid: std::process::id(),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;",
            RegistryDefaults::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                data BLOB NOT NULL,
                mode TEXT NOT NULL,
                owner_pid INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS nodes_parent ON nodes(parent);",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RpcError::Database {
            message: "Failed to acquire node store connection lock".to_string(),
            source: None,
        })
    }

    fn is_stale(mode: &str, owner_pid: u32) -> bool {
        NodeMode::from_str(mode) == Some(NodeMode::Ephemeral) && !is_process_alive(owner_pid)
    }

    /// Remove ephemeral nodes whose owning process has exited.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare("SELECT path, mode, owner_pid FROM nodes")?;
        let entries: Vec<(String, String, u32)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut removed = 0;
        for (path, mode, pid) in &entries {
            if Self::is_stale(mode, *pid) {
                conn.execute("DELETE FROM nodes WHERE path = ?1", params![path])?;
                removed += 1;
                debug!("Cleaned up stale node {} (PID {} dead)", path, pid);
            }
        }

        Ok(removed)
    }
}

impl NodeStore for SqliteNodeStore {
    fn ping(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()> {
        let conn = self.lock_conn()?;
        let (parent, _) = split_parent(path);
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO nodes (path, parent, data, mode, owner_pid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                 data=excluded.data,
                 mode=excluded.mode,
                 owner_pid=excluded.owner_pid,
                 created_at=excluded.created_at",
            params![path, parent, data, mode.as_str(), self.owner_pid, now],
        )?;

        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        let row: Option<(Vec<u8>, String, u32)> = conn
            .query_row(
                "SELECT data, mode, owner_pid FROM nodes WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((_, mode, pid)) if Self::is_stale(&mode, pid) => {
                conn.execute("DELETE FROM nodes WHERE path = ?1", params![path])?;
                debug!("Pruned stale node {} (PID {} dead)", path, pid);
                Ok(None)
            }
            Some((data, _, _)) => Ok(Some(data)),
            None => Ok(None),
        }
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT path, mode, owner_pid FROM nodes WHERE parent = ?1 ORDER BY path")?;

        let rows = stmt.query_map(params![path], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;

        let mut names = Vec::new();
        for row in rows {
            let (child, mode, pid) = row?;
            if Self::is_stale(&mode, pid) {
                continue;
            }
            names.push(split_parent(&child).1.to_string());
        }

        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute("DELETE FROM nodes WHERE path = ?1", params![path])?;
        Ok(rows > 0)
    }
}
