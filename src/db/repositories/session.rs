//! Session repository
//!
//! Durable storage for authenticated sessions. Each row projects one live
//! session: who owns it, the client it was last seen from, and when the user
//! signed in. Identifier rotation rewrites the key in place so the row keeps
//! its original sign-in time.

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::SessionRecord;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session row
    async fn insert(&self, record: &SessionRecord) -> Result<()>;

    /// Get session row by identifier
    async fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Move the row stored under `old_id` to `record.session_id`, refreshing
    /// the client address and user agent.
    ///
    /// Returns `false` when no row exists under `old_id`.
    async fn rotate(&self, old_id: &str, record: &SessionRecord) -> Result<bool>;

    /// Delete a session row, returns whether a row was removed
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// All rows of a user, most recent sign-in first
    async fn list_by_user(&self, user_id: i64) -> Result<Vec<SessionRecord>>;

    /// Delete rows whose sign-in is older than `cutoff`
    async fn delete_signed_in_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLx-based session repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    /// Create a new SQLx session repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn insert(&self, record: &SessionRecord) -> Result<()> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => insert_session_sqlite(self.pool.sqlite()?, record).await,
            DatabaseDriver::Mysql => insert_session_mysql(self.pool.mysql()?, record).await,
        }
    }

    async fn get_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                get_session_by_id_sqlite(self.pool.sqlite()?, session_id).await
            }
            DatabaseDriver::Mysql => get_session_by_id_mysql(self.pool.mysql()?, session_id).await,
        }
    }

    async fn rotate(&self, old_id: &str, record: &SessionRecord) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                rotate_session_sqlite(self.pool.sqlite()?, old_id, record).await
            }
            DatabaseDriver::Mysql => rotate_session_mysql(self.pool.mysql()?, old_id, record).await,
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => delete_session_sqlite(self.pool.sqlite()?, session_id).await,
            DatabaseDriver::Mysql => delete_session_mysql(self.pool.mysql()?, session_id).await,
        }
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<SessionRecord>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                list_sessions_by_user_sqlite(self.pool.sqlite()?, user_id).await
            }
            DatabaseDriver::Mysql => list_sessions_by_user_mysql(self.pool.mysql()?, user_id).await,
        }
    }

    async fn delete_signed_in_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                delete_signed_in_before_sqlite(self.pool.sqlite()?, cutoff).await
            }
            DatabaseDriver::Mysql => {
                delete_signed_in_before_mysql(self.pool.mysql()?, cutoff).await
            }
        }
    }
}

/// Packed address bytes: 4 for IPv4, 16 for IPv6
pub(crate) fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    bail!("Invalid stored IP address length: {}", bytes.len())
}

const SELECT_COLUMNS: &str = "SELECT session_id, user_id, ip_address, user_agent, sign_in FROM sessions";

// ============================================================================
// SQLite implementations
// ============================================================================

async fn insert_session_sqlite(pool: &SqlitePool, record: &SessionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, user_id, ip_address, user_agent, sign_in)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.session_id)
    .bind(record.user_id)
    .bind(ip_to_bytes(record.ip_address))
    .bind(&record.user_agent)
    .bind(record.sign_in)
    .execute(pool)
    .await
    .context("Failed to insert session")?;

    Ok(())
}

async fn get_session_by_id_sqlite(pool: &SqlitePool, session_id: &str) -> Result<Option<SessionRecord>> {
    let row = sqlx::query(&format!("{} WHERE session_id = ?", SELECT_COLUMNS))
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;

    row.as_ref().map(row_to_record_sqlite).transpose()
}

async fn rotate_session_sqlite(pool: &SqlitePool, old_id: &str, record: &SessionRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET session_id = ?, ip_address = ?, user_agent = ?
        WHERE session_id = ?
        "#,
    )
    .bind(&record.session_id)
    .bind(ip_to_bytes(record.ip_address))
    .bind(&record.user_agent)
    .bind(old_id)
    .execute(pool)
    .await
    .context("Failed to rotate session")?;

    Ok(result.rows_affected() > 0)
}

async fn delete_session_sqlite(pool: &SqlitePool, session_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await
        .context("Failed to delete session")?;

    Ok(result.rows_affected() > 0)
}

async fn list_sessions_by_user_sqlite(pool: &SqlitePool, user_id: i64) -> Result<Vec<SessionRecord>> {
    let rows = sqlx::query(&format!(
        "{} WHERE user_id = ? ORDER BY sign_in DESC",
        SELECT_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions by user")?;

    rows.iter().map(row_to_record_sqlite).collect()
}

async fn delete_signed_in_before_sqlite(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE sign_in < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to delete expired sessions")?;

    Ok(result.rows_affected())
}

fn row_to_record_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord> {
    let ip: Vec<u8> = row.get("ip_address");
    Ok(SessionRecord {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        ip_address: ip_from_bytes(&ip)?,
        user_agent: row.get("user_agent"),
        sign_in: row.get("sign_in"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn insert_session_mysql(pool: &MySqlPool, record: &SessionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, user_id, ip_address, user_agent, sign_in)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.session_id)
    .bind(record.user_id)
    .bind(ip_to_bytes(record.ip_address))
    .bind(&record.user_agent)
    .bind(record.sign_in)
    .execute(pool)
    .await
    .context("Failed to insert session")?;

    Ok(())
}

async fn get_session_by_id_mysql(pool: &MySqlPool, session_id: &str) -> Result<Option<SessionRecord>> {
    let row = sqlx::query(&format!("{} WHERE session_id = ?", SELECT_COLUMNS))
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;

    row.as_ref().map(row_to_record_mysql).transpose()
}

async fn rotate_session_mysql(pool: &MySqlPool, old_id: &str, record: &SessionRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET session_id = ?, ip_address = ?, user_agent = ?
        WHERE session_id = ?
        "#,
    )
    .bind(&record.session_id)
    .bind(ip_to_bytes(record.ip_address))
    .bind(&record.user_agent)
    .bind(old_id)
    .execute(pool)
    .await
    .context("Failed to rotate session")?;

    Ok(result.rows_affected() > 0)
}

async fn delete_session_mysql(pool: &MySqlPool, session_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await
        .context("Failed to delete session")?;

    Ok(result.rows_affected() > 0)
}

async fn list_sessions_by_user_mysql(pool: &MySqlPool, user_id: i64) -> Result<Vec<SessionRecord>> {
    let rows = sqlx::query(&format!(
        "{} WHERE user_id = ? ORDER BY sign_in DESC",
        SELECT_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("Failed to list sessions by user")?;

    rows.iter().map(row_to_record_mysql).collect()
}

async fn delete_signed_in_before_mysql(pool: &MySqlPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE sign_in < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to delete expired sessions")?;

    Ok(result.rows_affected())
}

fn row_to_record_mysql(row: &sqlx::mysql::MySqlRow) -> Result<SessionRecord> {
    let ip: Vec<u8> = row.get("ip_address");
    Ok(SessionRecord {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        ip_address: ip_from_bytes(&ip)?,
        user_agent: row.get("user_agent"),
        sign_in: row.get("sign_in"),
    })
}
