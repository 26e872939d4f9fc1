//! ABOUTME: Append-only detection result repository
//! ABOUTME: Supports camera, job and time-range filters with bounded pagination

use async_trait::async_trait;
use cw_core::{time::parse_rfc3339, to_rfc3339, CameraId, Error, Id, Result};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::models::{DetectionFilter, DetectionResult, NewDetection};
use crate::store::DetectionStore;

#[derive(Debug, FromRow)]
struct DetectionRow {
    id: i64,
    camera_id: i64,
    job_id: String,
    detected_at: String,
    image_reference: String,
    face_count: i64,
    test_mode: bool,
}

impl TryFrom<DetectionRow> for DetectionResult {
    type Error = Error;

    fn try_from(row: DetectionRow) -> Result<Self> {
        let job_id: Id = row
            .job_id
            .parse()
            .map_err(|e| Error::Database(format!("Invalid job id '{}': {}", row.job_id, e)))?;
        Ok(DetectionResult {
            id: row.id,
            camera_id: CameraId::new(row.camera_id),
            job_id,
            detected_at: parse_rfc3339(&row.detected_at)?,
            image_reference: row.image_reference,
            face_count: u32::try_from(row.face_count).unwrap_or(0),
            test_mode: row.test_mode,
        })
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &DetectionFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(camera_id) = filter.camera_id {
        builder.push(" AND camera_id = ").push_bind(camera_id.get());
    }
    if let Some(job_id) = &filter.job_id {
        builder.push(" AND job_id = ").push_bind(job_id.to_string());
    }
    if let Some(since) = filter.since {
        builder.push(" AND detected_at >= ").push_bind(to_rfc3339(since));
    }
    if let Some(until) = filter.until {
        builder.push(" AND detected_at < ").push_bind(to_rfc3339(until));
    }
}

#[derive(Debug, Clone)]
pub struct DetectionRepository {
    pool: SqlitePool,
}

impl DetectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DetectionStore for DetectionRepository {
    async fn append(&self, detection: NewDetection) -> Result<DetectionResult> {
        let result = sqlx::query(
            r#"
            INSERT INTO detections
                (camera_id, job_id, detected_at, image_reference, face_count, test_mode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(detection.camera_id.get())
        .bind(detection.job_id.to_string())
        .bind(to_rfc3339(detection.detected_at))
        .bind(&detection.image_reference)
        .bind(i64::from(detection.face_count))
        .bind(detection.test_mode)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to append detection: {}", e)))?;

        Ok(detection.into_result(result.last_insert_rowid()))
    }

    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionResult>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, camera_id, job_id, detected_at, image_reference, face_count, test_mode \
             FROM detections",
        );
        push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY detected_at DESC, id DESC LIMIT ")
            .push_bind(filter.effective_limit())
            .push(" OFFSET ")
            .push_bind(filter.effective_offset());

        let rows = builder
            .build_query_as::<DetectionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list detections: {}", e)))?;

        rows.into_iter().map(DetectionResult::try_from).collect()
    }

    async fn count(&self, filter: &DetectionFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM detections");
        push_filter(&mut builder, filter);

        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count detections: {}", e)))?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db::create_test_db;
    use chrono::{Duration, TimeZone, Utc};

    fn detection(camera: i64, job: &Id, offset_secs: i64) -> NewDetection {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        NewDetection {
            camera_id: CameraId::new(camera),
            job_id: job.clone(),
            detected_at: base + Duration::seconds(offset_secs),
            image_reference: format!("cam_{}/{}/{}.jpg", camera, job, offset_secs),
            face_count: 1,
            test_mode: false,
        }
    }

    #[tokio::test]
    async fn test_append_and_list_newest_first() {
        let repo = create_test_db().await.detections();
        let job = Id::new();

        for offset in 0..3 {
            repo.append(detection(1, &job, offset)).await.unwrap();
        }

        let results = repo.list(&DetectionFilter::default()).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].detected_at > results[1].detected_at);
        assert!(results[1].detected_at > results[2].detected_at);
        assert_eq!(results[0].job_id, job);
    }

    #[tokio::test]
    async fn test_filters_and_count() {
        let repo = create_test_db().await.detections();
        let job_a = Id::new();
        let job_b = Id::new();

        repo.append(detection(1, &job_a, 0)).await.unwrap();
        repo.append(detection(2, &job_a, 10)).await.unwrap();
        repo.append(detection(1, &job_b, 20)).await.unwrap();

        let camera_one = DetectionFilter::for_camera(CameraId::new(1));
        assert_eq!(repo.count(&camera_one).await.unwrap(), 2);

        let for_job = DetectionFilter::for_job(job_a.clone());
        let results = repo.list(&for_job).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.job_id == job_a));

        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let window =
            DetectionFilter::default().between(base + Duration::seconds(5), base + Duration::seconds(20));
        let results = repo.list(&window).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].camera_id, CameraId::new(2));
    }

    #[tokio::test]
    async fn test_test_mode_flag_is_stored() {
        let repo = create_test_db().await.detections();
        let job = Id::new();
        let mut one_shot = detection(4, &job, 0);
        one_shot.test_mode = true;
        repo.append(one_shot).await.unwrap();
        repo.append(detection(4, &job, 1)).await.unwrap();

        let results = repo.list(&DetectionFilter::for_camera(CameraId::new(4))).await.unwrap();
        assert_eq!(
            results.iter().map(|r| r.test_mode).collect::<Vec<_>>(),
            vec![false, true]
        );
    }

    #[tokio::test]
    async fn test_pagination_is_clamped() {
        let repo = create_test_db().await.detections();
        let job = Id::new();
        for offset in 0..105 {
            repo.append(detection(3, &job, offset)).await.unwrap();
        }

        let page = repo
            .list(&DetectionFilter::default().page(1000, 0))
            .await
            .unwrap();
        assert_eq!(page.len(), 100);

        let tail = repo
            .list(&DetectionFilter::default().page(100, 100))
            .await
            .unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(repo.count(&DetectionFilter::default()).await.unwrap(), 105);
    }
}
