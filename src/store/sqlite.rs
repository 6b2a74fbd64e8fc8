//! SQLite-backed phone store

use super::traits::parse_status;
use super::{EndpointStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provision_shared::{bound_message, now, EndpointRecord, Status, Tally};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn unavailable(context: &'static str, err: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    StoreError::Unavailable {
        context,
        source: Box::new(err),
    }
}

/// Map a statement failure, promoting errors that mean the database itself is gone.
/// Busy and locked stay per-row: the write lost a lock wait, the file is still usable.
fn query_err(context: &'static str, err: rusqlite::Error) -> StoreError {
    let lost = matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
        )
    );
    if lost {
        unavailable(context, err)
    } else {
        StoreError::Query {
            context,
            source: Box::new(err),
        }
    }
}

/// Store holding phone records in a single SQLite file.
///
/// Each operation opens its own connection on the blocking pool, so
/// concurrently running updates never share one.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database and apply the schema
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: path.into(),
        };
        store.with_connection(|_| Ok(())).await?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable("create parent dir", e))?;
        }
        let conn = Connection::open(path).map_err(|e| unavailable("open sqlite db", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| unavailable("set busy_timeout", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| unavailable("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| unavailable("set synchronous", e))?;
        Self::ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS phones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address TEXT NOT NULL UNIQUE,
                status TEXT NULL,
                error TEXT NULL,
                created TEXT NOT NULL,
                updated TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_phones_ip_address
            ON phones (ip_address);
            ",
        )
        .map_err(|e| unavailable("ensure schema", e))
    }

    /// Run `f` against a fresh connection on the blocking pool
    async fn with_connection<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::connect(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl EndpointStore for SqliteStore {
    async fn find(&self, address: &str) -> Result<Option<EndpointRecord>, StoreError> {
        let address = address.to_string();
        self.with_connection(move |conn| {
            let row = conn
                .query_row(
                    "SELECT ip_address, status, error, created, updated
                     FROM phones WHERE ip_address = ?1",
                    params![address],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, DateTime<Utc>>(3)?,
                            row.get::<_, Option<DateTime<Utc>>>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| query_err("find phone", e))?;

            row.map(|(address, status, error, created, updated)| -> Result<_, StoreError> {
                Ok(EndpointRecord {
                    status: parse_status(&address, status)?,
                    address,
                    error,
                    created,
                    updated,
                })
            })
            .transpose()
        })
        .await
    }

    async fn insert(&self, address: &str) -> Result<usize, StoreError> {
        let address = address.to_string();
        self.with_connection(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| query_err("begin tx", e))?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO phones (ip_address, created) VALUES (?1, ?2)",
                    params![address, now()],
                )
                .map_err(|e| query_err("insert phone", e))?;
            tx.commit().map_err(|e| query_err("commit tx", e))?;
            Ok(inserted)
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT ip_address FROM phones
                     WHERE status IS NULL OR status != ?1
                     ORDER BY id ASC",
                )
                .map_err(|e| query_err("prepare list pending", e))?;
            let rows = stmt
                .query_map(params![Status::Success.as_str()], |row| row.get::<_, String>(0))
                .map_err(|e| query_err("list pending", e))?;

            let mut addresses = Vec::new();
            for row in rows {
                addresses.push(row.map_err(|e| query_err("read pending row", e))?);
            }
            Ok(addresses)
        })
        .await
    }

    async fn update_status(
        &self,
        address: &str,
        status: Status,
        message: &str,
    ) -> Result<usize, StoreError> {
        let address = address.to_string();
        let message = bound_message(message);
        self.with_connection(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| query_err("begin tx", e))?;
            let updated = tx
                .execute(
                    "UPDATE phones SET status = ?1, error = ?2, updated = ?3
                     WHERE ip_address = ?4",
                    params![status.as_str(), message, now(), address],
                )
                .map_err(|e| query_err("update phone", e))?;
            tx.commit().map_err(|e| query_err("commit tx", e))?;
            Ok(updated)
        })
        .await
    }

    async fn clear_all(&self) -> Result<usize, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| query_err("begin tx", e))?;
            let removed = tx
                .execute("DELETE FROM phones", [])
                .map_err(|e| query_err("clear phones", e))?;
            tx.commit().map_err(|e| query_err("commit tx", e))?;
            Ok(removed)
        })
        .await
    }

    async fn tally(&self, addresses: &[String]) -> Result<Tally, StoreError> {
        let addresses = addresses.to_vec();
        self.with_connection(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| query_err("begin tx", e))?;
            let mut tally = Tally::default();
            {
                let mut stmt = tx
                    .prepare("SELECT status FROM phones WHERE ip_address = ?1")
                    .map_err(|e| query_err("prepare tally", e))?;
                for address in addresses {
                    let label: Option<String> = stmt
                        .query_row(params![address], |row| row.get(0))
                        .optional()
                        .map_err(|e| query_err("tally phone", e))?
                        .flatten();
                    match parse_status(&address, label)? {
                        Some(Status::Success) => tally.success.push(address),
                        Some(_) => tally.error.push(address),
                        None => {}
                    }
                }
            }
            tx.commit().map_err(|e| query_err("commit tx", e))?;
            Ok(tally)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
