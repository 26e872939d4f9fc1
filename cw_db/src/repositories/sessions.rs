//! ABOUTME: Stream session history repository
//! ABOUTME: One row per session from start until it is stopped

use async_trait::async_trait;
use cw_core::{time::parse_rfc3339, to_rfc3339, utc_now, CameraId, Error, Result};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::models::{SessionRecord, SessionStatus};
use crate::store::SessionStore;

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: String,
    camera_id: i64,
    started_at: String,
    ended_at: Option<String>,
    status: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let session_id = Uuid::parse_str(&row.session_id).map_err(|e| {
            Error::Database(format!("Invalid session id '{}': {}", row.session_id, e))
        })?;
        Ok(SessionRecord {
            session_id,
            camera_id: CameraId::new(row.camera_id),
            started_at: parse_rfc3339(&row.started_at)?,
            ended_at: row.ended_at.as_deref().map(parse_rfc3339).transpose()?,
            status: row.status.parse()?,
        })
    }
}

const SELECT_COLUMNS: &str = "session_id, camera_id, started_at, ended_at, status";

#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SessionRepository {
    async fn record(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_sessions (session_id, camera_id, started_at, ended_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(session.session_id.to_string())
        .bind(session.camera_id.get())
        .bind(to_rfc3339(session.started_at))
        .bind(session.ended_at.map(to_rfc3339))
        .bind(session.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record stream session: {}", e)))?;

        Ok(())
    }

    async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<bool> {
        let ended_at = (status == SessionStatus::Stopped).then(|| to_rfc3339(utc_now()));

        let result = sqlx::query(
            r#"
            UPDATE stream_sessions SET status = ?1, ended_at = COALESCE(?2, ended_at)
            WHERE session_id = ?3 AND status != 'stopped'
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update stream session: {}", e)))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get(session_id).await? {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!(
                "Stream session {} not found",
                session_id
            ))),
        }
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM stream_sessions WHERE session_id = ?1",
            SELECT_COLUMNS
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find stream session: {}", e)))?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn list(&self, camera_id: Option<CameraId>, limit: i64) -> Result<Vec<SessionRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM stream_sessions",
            SELECT_COLUMNS
        ));
        if let Some(camera_id) = camera_id {
            builder.push(" WHERE camera_id = ").push_bind(camera_id.get());
        }
        builder
            .push(" ORDER BY started_at DESC, session_id DESC LIMIT ")
            .push_bind(limit.max(1));

        let rows = builder
            .build_query_as::<SessionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list stream sessions: {}", e)))?;

        rows.into_iter().map(SessionRecord::try_from).collect()
    }

    async fn close_open(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stream_sessions SET status = 'stopped', ended_at = ?1
            WHERE status != 'stopped'
            "#,
        )
        .bind(to_rfc3339(utc_now()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to close open stream sessions: {}", e)))?;

        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "Closed stream sessions left open");
        }
        Ok(result.rows_affected())
    }
}
