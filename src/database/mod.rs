//!
//! # Database Module for Turnstile
//!
//! This module provides database management for the Turnstile admission
//! gateway. It handles database initialization, connection management, and
//! schema migrations for the two tables the gateway owns: persisted
//! admission buckets and the error log.
//!
//! ## Migration System
//!
//! Migrations are stored in code as `Migration` structs and tracked in a
//! `migrations` table. They are applied on first run when the database file
//! is created, and afterwards only when explicitly requested via the CLI.

pub mod queries;

use sqlx::{Row, Sqlite, migrate::MigrateDatabase, sqlite::SqlitePool};
use std::collections::HashMap;
use tracing::{error, info, warn};

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Database manager that handles initialization and migrations
pub struct DatabaseManager {
    pool: SqlitePool,
}

/// Represents a database migration with version and SQL
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub sql: String,
}

impl DatabaseManager {
    /// Create a new manager with a connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database, creating the file if it doesn't exist
    pub async fn connect_with_file_creation(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("Opening turnstile database: {}", database_url);

        // if it does not exist, create and apply migrations then leave
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            info!("Database does not exist at {}, creating it", database_url);
            Sqlite::create_database(database_url).await?;

            let pool = SqlitePool::connect(database_url).await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            info!("Database created successfully at {}", database_url);

            let db_manager = Self::new(pool);
            db_manager.create_migrations_table().await?;
            db_manager.apply_pending_migrations().await?;
            info!("Initial migrations applied successfully.");
            return Ok(db_manager);
        }

        let pool = SqlitePool::connect(database_url).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Initialize the database by creating the migrations table if needed
    pub async fn initialize(&self) -> Result<(), sqlx::Error> {
        info!("Initializing database...");
        self.create_migrations_table().await?;
        let (_applied, pending) = self.migration_status().await?;
        if !pending.is_empty() {
            warn!("Pending migrations: {:?}", pending);
        } else {
            info!("No pending migrations.");
        }
        Ok(())
    }

    /// Create the migrations tracking table
    async fn create_migrations_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get all available migrations in order
    fn get_migrations(&self) -> Vec<Migration> {
        vec![Migration {
            version: 1,
            name: "initial_schema".to_string(),
            sql: r#"
                    CREATE TABLE IF NOT EXISTS buckets (
                        identity TEXT PRIMARY KEY,
                        count INTEGER NOT NULL,
                        window_start_ms INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS error_logs (
                        id TEXT PRIMARY KEY,
                        error_message TEXT NOT NULL,
                        severity TEXT NOT NULL,
                        context TEXT,
                        file_location TEXT,
                        line_number INTEGER,
                        function_name TEXT,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_error_logs_created_at
                        ON error_logs(created_at);
                "#
            .to_string(),
        }]
    }

    /// Get applied migrations as a map (version -> name)
    async fn get_applied_migrations(&self) -> Result<HashMap<u32, String>, sqlx::Error> {
        let rows = sqlx::query("SELECT version, name FROM migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("version"), row.get("name")))
            .collect())
    }

    /// Check migration status: returns (applied, pending) versions
    pub async fn migration_status(&self) -> Result<(Vec<u32>, Vec<u32>), sqlx::Error> {
        let all_migrations = self.get_migrations();
        let applied_migrations = self.get_applied_migrations().await?;
        let mut applied = Vec::new();
        let mut pending = Vec::new();

        for migration in all_migrations {
            if applied_migrations.contains_key(&migration.version) {
                applied.push(migration.version);
            } else {
                pending.push(migration.version);
            }
        }

        applied.sort();
        pending.sort();
        Ok((applied, pending))
    }

    /// Apply all pending migrations in order
    pub async fn apply_pending_migrations(&self) -> Result<(), sqlx::Error> {
        let migrations = self.get_migrations();
        let applied_migrations = self.get_applied_migrations().await?;

        for migration in migrations {
            if !applied_migrations.contains_key(&migration.version) {
                info!(
                    "Applying migration {}: {}",
                    migration.version, migration.name
                );
                sqlx::query(&migration.sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        error!("Failed to apply migration {}: {}", migration.version, e);
                        e
                    })?;
                sqlx::query("INSERT INTO migrations (version, name) VALUES (?, ?)")
                    .bind(migration.version)
                    .bind(&migration.name)
                    .execute(&self.pool)
                    .await?;
                info!("Applied migration {}: {}", migration.version, migration.name);
            }
        }
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
