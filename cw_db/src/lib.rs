//! ABOUTME: Database layer with SQLite, migrations, and repositories
//! ABOUTME: Persists cameras, detection results, job history and stream sessions

use cw_core::{Error, Result};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, Sqlite, SqlitePool,
};
use tracing::{debug, info, instrument};

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use memory::{MemoryCameraStore, MemoryDetectionStore, MemoryJobStore, MemorySessionStore};
pub use models::{
    Camera, CameraStatus, DetectionFilter, DetectionResult, JobMode, JobRecord, JobStatus,
    NewCamera, NewDetection, SessionRecord, SessionStatus, UpdateCamera, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
pub use repositories::{CameraRepository, DetectionRepository, JobRepository, SessionRepository};
pub use store::{CameraStore, DetectionStore, JobStore, SessionStore};

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if needed) the database and run migrations
    #[instrument(skip(db_path))]
    pub async fn new(db_path: &str, pool_size: u32, wal: bool) -> Result<Self> {
        info!("Initializing database at: {}", db_path);

        let database_url = format!("sqlite://{}", db_path);
        if !Sqlite::database_exists(&database_url)
            .await
            .unwrap_or(false)
        {
            info!("Creating database: {}", database_url);
            Sqlite::create_database(&database_url)
                .await
                .map_err(|e| Error::Database(format!("Failed to create database: {}", e)))?;
        }

        let journal_mode = if wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(journal_mode)
            .create_if_missing(true)
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "memory")
            .pragma("busy_timeout", "30000");

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| Error::Database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Run database migrations
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wrap an existing pool; migrations are not run
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn cameras(&self) -> CameraRepository {
        CameraRepository::new(self.pool.clone())
    }

    pub fn detections(&self) -> DetectionRepository {
        DetectionRepository::new(self.pool.clone())
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    pub fn sessions(&self) -> SessionRepository {
        SessionRepository::new(self.pool.clone())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing database health check");

        let row = sqlx::query("SELECT 1 AS ok")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;

        let ok: i64 = row.get("ok");
        if ok != 1 {
            return Err(Error::Database("Health check returned unexpected value".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_db {
    use super::*;
    use cw_core::Id;

    /// Create a test database with a unique file name
    pub async fn create_test_db() -> Db {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("test_camwatch_{}.db", Id::new()));
        let path = path.to_string_lossy().into_owned();
        let _ = tokio::fs::remove_file(&path).await;
        Db::new(&path, 4, true)
            .await
            .expect("Failed to create test database")
    }

    #[tokio::test]
    async fn test_database_initialization() {
        let db = create_test_db().await;
        db.health_check().await.expect("Health check should pass");
        assert!(db.cameras().list().await.unwrap().is_empty());
    }
}
