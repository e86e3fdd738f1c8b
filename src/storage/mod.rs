//! Storage layer for mappings, registered users and analysis records
//!
//! All tables live in one libsql database. [`Database`] owns the handle and
//! a single shared connection, so in-memory databases keep their schema for
//! the lifetime of the handle.

pub mod identity;
pub mod records;

use crate::error::{CollabError, Result};
use chrono::Utc;
use libsql::{params, Builder, Connection};
use std::path::Path;
use tracing::{debug, info};

/// Embedded migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/001_initial_schema.sql"),
)];

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database, created if missing
    Local(String),
    /// In-memory database (for testing)
    InMemory,
}

/// Open libsql database with migrations applied
pub struct Database {
    _db: libsql::Database,
    conn: Connection,
}

impl Database {
    /// Open a database and bring its schema up to date
    pub async fn open(mode: ConnectionMode) -> Result<Self> {
        info!("Opening libsql database: {:?}", mode);

        let db = match mode {
            ConnectionMode::Local(ref path) => {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            CollabError::Database(format!(
                                "Failed to create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }

                Builder::new_local(path).build().await.map_err(|e| {
                    CollabError::Database(format!("Failed to create local database: {}", e))
                })?
            }
            ConnectionMode::InMemory => Builder::new_local(":memory:").build().await.map_err(|e| {
                CollabError::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let conn = db
            .connect()
            .map_err(|e| CollabError::Database(format!("Failed to get connection: {}", e)))?;

        let database = Self { _db: db, conn };
        database.verify_health().await?;
        database.run_migrations().await?;
        Ok(database)
    }

    /// Open a local file database (convenience method)
    pub async fn open_local(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(ConnectionMode::Local(path.as_ref().to_string_lossy().into_owned())).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(ConnectionMode::InMemory).await
    }

    /// Shared connection for the stores built on this database
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    async fn verify_health(&self) -> Result<()> {
        self.conn.query("SELECT 1", params![]).await.map_err(|e| {
            CollabError::Database(format!(
                "Database corruption detected or invalid database file: {}",
                e
            ))
        })?;

        debug!("Database health check passed");
        Ok(())
    }

    /// Apply pending embedded migrations
    pub async fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS _migrations_applied (
                    migration_name TEXT PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                )",
                params![],
            )
            .await
            .map_err(|e| CollabError::Database(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = self
                .conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;

            let already_applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            };

            if already_applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            self.conn.execute_batch(sql).await.map_err(|e| {
                CollabError::Database(format!("Failed to execute migration {}: {}", name, e))
            })?;

            self.conn
                .execute(
                    "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                    params![*name, Utc::now().timestamp()],
                )
                .await
                .map_err(|e| CollabError::Database(format!("Failed to record migration: {}", e)))?;

            info!("Executed migration: {}", name);
        }

        Ok(())
    }
}
