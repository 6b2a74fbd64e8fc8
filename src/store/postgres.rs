//! Postgres-backed phone store
//!
//! Every operation checks a connection out of the pool for its own duration,
//! so concurrent updates never share one.

use super::traits::parse_status;
use super::{EndpointStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provision_shared::{bound_message, now, EndpointRecord, Status, Tally};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;

const POOL_SIZE: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for a Postgres server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
    pub password: String,
}

/// Stock settings of the official postgres container
impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
        }
    }
}

impl PostgresSettings {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.username)
            .password(&self.password)
    }
}

fn unavailable(context: &'static str, err: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        context,
        source: Box::new(err),
    }
}

/// SQLSTATE classes meaning the server or session is gone rather than the statement being wrong
fn is_lost_session(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("53") || code.starts_with("57P") || code == "3D000"
}

fn query_err(context: &'static str, err: sqlx::Error) -> StoreError {
    let lost = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_lost_session(&code)),
        _ => false,
    };
    if lost {
        unavailable(context, err)
    } else {
        StoreError::Query {
            context,
            source: Box::new(err),
        }
    }
}

/// Store holding phone records in a Postgres `phones` table
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and apply the schema. Fails fast when the server is unreachable.
    pub async fn open(settings: &PostgresSettings) -> Result<Self, StoreError> {
        Self::open_with(settings.connect_options()).await
    }

    async fn open_with(options: PgConnectOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| unavailable("connect postgres", e))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS phones (
                id SERIAL PRIMARY KEY,
                ip_address VARCHAR(64) NOT NULL UNIQUE,
                status VARCHAR(32) NULL,
                error TEXT NULL,
                created TIMESTAMPTZ NOT NULL,
                updated TIMESTAMPTZ NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("ensure schema", e))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_phones_ip_address ON phones (ip_address)")
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("ensure schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl EndpointStore for PostgresStore {
    async fn find(&self, address: &str) -> Result<Option<EndpointRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT ip_address, status, error, created, updated
             FROM phones WHERE ip_address = $1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("find phone", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e| query_err("decode phone", e);
        let address: String = row.try_get("ip_address").map_err(decode)?;
        let status: Option<String> = row.try_get("status").map_err(decode)?;
        Ok(Some(EndpointRecord {
            status: parse_status(&address, status)?,
            error: row.try_get("error").map_err(decode)?,
            created: row.try_get::<DateTime<Utc>, _>("created").map_err(decode)?,
            updated: row
                .try_get::<Option<DateTime<Utc>>, _>("updated")
                .map_err(decode)?,
            address,
        }))
    }

    async fn insert(&self, address: &str) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_err("begin tx", e))?;
        let inserted = sqlx::query(
            "INSERT INTO phones (ip_address, created) VALUES ($1, $2)
             ON CONFLICT (ip_address) DO NOTHING",
        )
        .bind(address)
        .bind(now())
        .execute(&mut *tx)
        .await
        .map_err(|e| query_err("insert phone", e))?
        .rows_affected();
        tx.commit().await.map_err(|e| query_err("commit tx", e))?;
        Ok(inserted as usize)
    }

    async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT ip_address FROM phones
             WHERE status IS NULL OR status <> $1
             ORDER BY id ASC",
        )
        .bind(Status::Success.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_err("list pending", e))
    }

    async fn update_status(
        &self,
        address: &str,
        status: Status,
        message: &str,
    ) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_err("begin tx", e))?;
        let updated = sqlx::query(
            "UPDATE phones SET status = $1, error = $2, updated = $3
             WHERE ip_address = $4",
        )
        .bind(status.as_str())
        .bind(bound_message(message))
        .bind(now())
        .bind(address)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_err("update phone", e))?
        .rows_affected();
        tx.commit().await.map_err(|e| query_err("commit tx", e))?;
        Ok(updated as usize)
    }

    async fn clear_all(&self) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_err("begin tx", e))?;
        let removed = sqlx::query("DELETE FROM phones")
            .execute(&mut *tx)
            .await
            .map_err(|e| query_err("clear phones", e))?
            .rows_affected();
        tx.commit().await.map_err(|e| query_err("commit tx", e))?;
        Ok(removed as usize)
    }

    async fn tally(&self, addresses: &[String]) -> Result<Tally, StoreError> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT ip_address, status FROM phones WHERE ip_address = ANY($1)")
                .bind(addresses)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| query_err("tally phones", e))?;
        let mut statuses: HashMap<String, Option<String>> = rows.into_iter().collect();

        let mut tally = Tally::default();
        for address in addresses {
            let label = statuses.remove(address).flatten();
            match parse_status(address, label)? {
                Some(Status::Success) => tally.success.push(address.clone()),
                Some(_) => tally.error.push(address.clone()),
                None => {}
            }
        }
        Ok(tally)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
