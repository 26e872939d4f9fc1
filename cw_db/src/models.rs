//! ABOUTME: Persisted record types shared by the stores and the scheduler
//! ABOUTME: Cameras, detection results, detection job history and their validation

use chrono::{DateTime, Utc};
use cw_core::{CameraId, Error, Id, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Default page size for result listings
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Upper bound on a single page of results
pub const MAX_PAGE_SIZE: i64 = 100;

/// Lifecycle status of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Idle,
    Streaming,
    Detecting,
    StreamingAndDetecting,
}

impl CameraStatus {
    pub fn from_flags(streaming: bool, detecting: bool) -> Self {
        match (streaming, detecting) {
            (false, false) => CameraStatus::Idle,
            (true, false) => CameraStatus::Streaming,
            (false, true) => CameraStatus::Detecting,
            (true, true) => CameraStatus::StreamingAndDetecting,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            CameraStatus::Streaming | CameraStatus::StreamingAndDetecting
        )
    }

    pub fn is_detecting(&self) -> bool {
        matches!(
            self,
            CameraStatus::Detecting | CameraStatus::StreamingAndDetecting
        )
    }

    /// Cameras can only be deleted while nothing is streaming or detecting on them
    pub fn ensure_removable(&self, id: CameraId) -> Result<()> {
        if *self != CameraStatus::Idle {
            return Err(Error::InvalidState(format!(
                "Camera {} is {}; stop all activity before removing it",
                id, self
            )));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Idle => "idle",
            CameraStatus::Streaming => "streaming",
            CameraStatus::Detecting => "detecting",
            CameraStatus::StreamingAndDetecting => "streaming_and_detecting",
        }
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(CameraStatus::Idle),
            "streaming" => Ok(CameraStatus::Streaming),
            "detecting" => Ok(CameraStatus::Detecting),
            "streaming_and_detecting" => Ok(CameraStatus::StreamingAndDetecting),
            other => Err(Error::Database(format!("Unknown camera status '{}'", other))),
        }
    }
}

/// Registered camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: CameraId,
    pub name: String,
    pub address: String,
    pub location: String,
    pub status: CameraStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_address(address: &str) -> std::result::Result<(), ValidationError> {
    if IpAddr::from_str(address).is_ok() {
        return Ok(());
    }
    match url::Url::parse(address) {
        Ok(url) if matches!(url.scheme(), "rtsp" | "http" | "https") && url.host().is_some() => {
            Ok(())
        }
        _ => Err(ValidationError::new("address_format")
            .with_message("address must be an IP address or an rtsp/http(s) URL".into())),
    }
}

fn validate_not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new("blank"))
    } else {
        Ok(())
    }
}

fn validation_error(errors: validator::ValidationErrors) -> Error {
    Error::Validation(errors.to_string())
}

/// Request to register a new camera
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewCamera {
    #[validate(
        length(min = 1, max = 100),
        custom(function = "validate_not_blank")
    )]
    pub name: String,
    #[validate(
        length(min = 1, max = 255),
        custom(function = "validate_address")
    )]
    pub address: String,
    #[validate(
        length(min = 1, max = 200),
        custom(function = "validate_not_blank")
    )]
    pub location: String,
}

impl NewCamera {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            location: location.into(),
        }
    }

    /// Trim surrounding whitespace and validate every field
    pub fn validated(self) -> Result<Self> {
        let cleaned = Self {
            name: self.name.trim().to_string(),
            address: self.address.trim().to_string(),
            location: self.location.trim().to_string(),
        };
        cleaned.validate().map_err(validation_error)?;
        Ok(cleaned)
    }
}

/// Partial update of a camera's static attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateCamera {
    #[validate(
        length(min = 1, max = 100),
        custom(function = "validate_not_blank")
    )]
    pub name: Option<String>,
    #[validate(
        length(min = 1, max = 255),
        custom(function = "validate_address")
    )]
    pub address: Option<String>,
    #[validate(
        length(min = 1, max = 200),
        custom(function = "validate_not_blank")
    )]
    pub location: Option<String>,
}

impl UpdateCamera {
    pub fn validated(self) -> Result<Self> {
        let trim = |v: Option<String>| v.map(|s| s.trim().to_string());
        let cleaned = Self {
            name: trim(self.name),
            address: trim(self.address),
            location: trim(self.location),
        };
        cleaned.validate().map_err(validation_error)?;
        Ok(cleaned)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.address.is_none() && self.location.is_none()
    }

    /// Apply the present fields onto an existing camera
    pub fn apply_to(&self, camera: &mut Camera) {
        if let Some(name) = &self.name {
            camera.name = name.clone();
        }
        if let Some(address) = &self.address {
            camera.address = address.clone();
        }
        if let Some(location) = &self.location {
            camera.location = location.clone();
        }
    }
}

/// Detection job mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Manual,
    Automatic,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Manual => "manual",
            JobMode::Automatic => "automatic",
        }
    }
}

impl FromStr for JobMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(JobMode::Manual),
            "automatic" => Ok(JobMode::Automatic),
            other => Err(Error::Database(format!("Unknown job mode '{}'", other))),
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Aborted)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(Error::Database(format!("Unknown job status '{}'", other))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a detection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Id,
    pub mode: JobMode,
    pub target_camera_ids: Vec<CameraId>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a persisted stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Frame source failing; the session still holds its slot
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Error => "error",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "error" => Ok(SessionStatus::Error),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(Error::Database(format!("Unknown session status '{}'", other))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable history of one stream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub camera_id: CameraId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// Stored detection event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub id: i64,
    pub camera_id: CameraId,
    pub job_id: Id,
    pub detected_at: DateTime<Utc>,
    pub image_reference: String,
    pub face_count: u32,
    /// Produced by a one-shot test detection rather than a job
    #[serde(default)]
    pub test_mode: bool,
}

/// Detection event about to be appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetection {
    pub camera_id: CameraId,
    pub job_id: Id,
    pub detected_at: DateTime<Utc>,
    pub image_reference: String,
    pub face_count: u32,
    #[serde(default)]
    pub test_mode: bool,
}

impl NewDetection {
    pub fn into_result(self, id: i64) -> DetectionResult {
        DetectionResult {
            id,
            camera_id: self.camera_id,
            job_id: self.job_id,
            detected_at: self.detected_at,
            image_reference: self.image_reference,
            face_count: self.face_count,
            test_mode: self.test_mode,
        }
    }
}

/// Query over stored detections; newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFilter {
    pub camera_id: Option<CameraId>,
    pub job_id: Option<Id>,
    /// Inclusive lower bound on `detected_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `detected_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            camera_id: None,
            job_id: None,
            since: None,
            until: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl DetectionFilter {
    pub fn for_camera(camera_id: CameraId) -> Self {
        Self {
            camera_id: Some(camera_id),
            ..Default::default()
        }
    }

    pub fn for_job(job_id: Id) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }

    pub fn matches(&self, result: &DetectionResult) -> bool {
        self.camera_id.map_or(true, |c| c == result.camera_id)
            && self.job_id.as_ref().map_or(true, |j| *j == result.job_id)
            && self.since.map_or(true, |s| result.detected_at >= s)
            && self.until.map_or(true, |u| result.detected_at < u)
    }
}
