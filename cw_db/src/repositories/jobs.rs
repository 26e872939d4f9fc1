//! ABOUTME: Detection job history repository
//! ABOUTME: Records manual and automatic jobs with their target cameras and outcome

use async_trait::async_trait;
use cw_core::{time::parse_rfc3339, to_rfc3339, utc_now, CameraId, Error, Id, Result};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use crate::models::{JobRecord, JobStatus};
use crate::store::JobStore;

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    mode: String,
    target_camera_ids: String,
    window_start: String,
    window_end: String,
    status: String,
    created_at: String,
    finished_at: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let id: Id = row
            .id
            .parse()
            .map_err(|e| Error::Database(format!("Invalid job id '{}': {}", row.id, e)))?;
        let target_camera_ids: Vec<CameraId> = serde_json::from_str(&row.target_camera_ids)
            .map_err(|e| Error::Database(format!("Invalid target camera list: {}", e)))?;

        Ok(JobRecord {
            id,
            mode: row.mode.parse()?,
            target_camera_ids,
            window_start: parse_rfc3339(&row.window_start)?,
            window_end: parse_rfc3339(&row.window_end)?,
            status: row.status.parse()?,
            created_at: parse_rfc3339(&row.created_at)?,
            finished_at: row.finished_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "id, mode, target_camera_ids, window_start, window_end, status, created_at, finished_at";

#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn record(&self, job: &JobRecord) -> Result<()> {
        let targets = serde_json::to_string(&job.target_camera_ids)
            .map_err(|e| Error::Database(format!("Failed to encode target cameras: {}", e)))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO detection_jobs
                (id, mode, target_camera_ids, window_start, window_end, status, created_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.mode.as_str())
        .bind(targets)
        .bind(to_rfc3339(job.window_start))
        .bind(to_rfc3339(job.window_end))
        .bind(job.status.as_str())
        .bind(to_rfc3339(job.created_at))
        .bind(job.finished_at.map(to_rfc3339))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record job: {}", e)))?;

        Ok(())
    }

    async fn update_status(&self, id: &Id, status: JobStatus) -> Result<bool> {
        let finished_at = status.is_terminal().then(|| to_rfc3339(utc_now()));

        let result = sqlx::query(
            r#"
            UPDATE detection_jobs SET status = ?1, finished_at = COALESCE(?2, finished_at)
            WHERE id = ?3 AND status NOT IN ('completed', 'aborted')
            "#,
        )
        .bind(status.as_str())
        .bind(finished_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update job status: {}", e)))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("Job {} not found", id))),
        }
    }

    async fn get(&self, id: &Id) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM detection_jobs WHERE id = ?1",
            SELECT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find job: {}", e)))?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM detection_jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        ))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn abort_unfinished(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE detection_jobs SET status = 'aborted', finished_at = ?1
            WHERE status IN ('pending', 'running')
            "#,
        )
        .bind(to_rfc3339(utc_now()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to abort unfinished jobs: {}", e)))?;

        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "Marked interrupted jobs as aborted");
        }
        Ok(result.rows_affected())
    }
}
