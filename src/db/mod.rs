//! Database layer
//!
//! Persistent session storage backed by either:
//! - SQLite (default, for single-binary deployment)
//! - MySQL (for larger deployments)
//!
//! The driver is selected from configuration and hidden behind the
//! `DatabasePool` trait, so repositories work with either backend.
//!
//! # Usage
//!
//! ```ignore
//! use tandem::config::DatabaseConfig;
//! use tandem::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, MysqlDatabase, SqliteDatabase,
};
