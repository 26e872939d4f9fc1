//! ABOUTME: Camera repository backed by the cameras table
//! ABOUTME: Enforces unique addresses and persists camera status changes

use async_trait::async_trait;
use cw_core::{time::parse_rfc3339, to_rfc3339, utc_now, CameraId, Error, Result};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::models::{Camera, CameraStatus, NewCamera, UpdateCamera};
use crate::store::CameraStore;

#[derive(Debug, FromRow)]
struct CameraRow {
    id: i64,
    name: String,
    address: String,
    location: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<CameraRow> for Camera {
    type Error = Error;

    fn try_from(row: CameraRow) -> Result<Self> {
        Ok(Camera {
            id: CameraId::new(row.id),
            name: row.name,
            address: row.address,
            location: row.location,
            status: row.status.parse()?,
            created_at: parse_rfc3339(&row.created_at)?,
            updated_at: parse_rfc3339(&row.updated_at)?,
        })
    }
}

fn map_write_error(action: &str, address: &str, e: sqlx::Error) -> Error {
    let unique = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if unique {
        Error::Conflict(format!("A camera with address '{}' already exists", address))
    } else {
        Error::Database(format!("Failed to {} camera: {}", action, e))
    }
}

const SELECT_COLUMNS: &str = "id, name, address, location, status, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct CameraRepository {
    pool: SqlitePool,
}

impl CameraRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find(&self, id: CameraId) -> Result<Option<Camera>> {
        let row = sqlx::query_as::<_, CameraRow>(&format!(
            "SELECT {} FROM cameras WHERE id = ?1",
            SELECT_COLUMNS
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find camera: {}", e)))?;

        row.map(Camera::try_from).transpose()
    }
}

#[async_trait]
impl CameraStore for CameraRepository {
    async fn insert(&self, camera: NewCamera) -> Result<Camera> {
        let camera = camera.validated()?;
        let now = to_rfc3339(utc_now());

        let row = sqlx::query_as::<_, CameraRow>(&format!(
            r#"
            INSERT INTO cameras (name, address, location, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'idle', ?4, ?4)
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(&camera.name)
        .bind(&camera.address)
        .bind(&camera.location)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error("create", &camera.address, e))?;

        debug!(camera_id = row.id, "Inserted camera");
        Camera::try_from(row)
    }

    async fn update(&self, id: CameraId, update: UpdateCamera) -> Result<Camera> {
        let update = update.validated()?;
        let mut camera = self
            .find(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;
        if update.is_empty() {
            return Ok(camera);
        }
        update.apply_to(&mut camera);
        let now = to_rfc3339(utc_now());

        let row = sqlx::query_as::<_, CameraRow>(&format!(
            r#"
            UPDATE cameras SET name = ?1, address = ?2, location = ?3, updated_at = ?4
            WHERE id = ?5
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(&camera.name)
        .bind(&camera.address)
        .bind(&camera.location)
        .bind(&now)
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error("update", &camera.address, e))?
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;

        Camera::try_from(row)
    }

    async fn set_status(&self, id: CameraId, status: CameraStatus) -> Result<()> {
        let result = sqlx::query("UPDATE cameras SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(to_rfc3339(utc_now()))
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update camera status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Camera {} not found", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: CameraId) -> Result<()> {
        let result = sqlx::query("DELETE FROM cameras WHERE id = ?1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete camera: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Camera {} not found", id)));
        }
        Ok(())
    }

    async fn get(&self, id: CameraId) -> Result<Option<Camera>> {
        self.find(id).await
    }

    async fn list(&self) -> Result<Vec<Camera>> {
        let rows = sqlx::query_as::<_, CameraRow>(&format!(
            "SELECT {} FROM cameras ORDER BY id ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list cameras: {}", e)))?;

        rows.into_iter().map(Camera::try_from).collect()
    }

    async fn reset_statuses(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE cameras SET status = 'idle', updated_at = ?1 WHERE status != 'idle'",
        )
        .bind(to_rfc3339(utc_now()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to reset camera statuses: {}", e)))?;

        Ok(result.rows_affected())
    }
}
