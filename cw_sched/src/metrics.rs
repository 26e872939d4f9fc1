//! ABOUTME: Prometheus metrics for the scheduling engine
//! ABOUTME: Slot usage per pool, stream frame counters and detection job counters

use std::sync::Arc;

use cw_core::{Error, PoolKind, Result};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    pub pool: String,
}

/// Engine metrics; clones share the same underlying series
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    pub slots_in_use: Family<PoolLabels, Gauge>,
    pub slot_denials: Family<PoolLabels, Counter>,
    pub frames_generated: Counter,
    pub frame_errors: Counter,
    pub frame_timeouts: Counter,
    pub degraded_sessions: Gauge,
    pub detection_invocations: Counter,
    pub capability_failures: Counter,
    pub detections_found: Counter,
    pub jobs_scheduled: Counter,
    pub jobs_completed: Counter,
    pub jobs_aborted: Counter,
    pub cycles_completed: Counter,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("camwatch");

        let slots_in_use = Family::<PoolLabels, Gauge>::default();
        registry.register("slots_in_use", "Slots currently held", slots_in_use.clone());
        let slot_denials = Family::<PoolLabels, Counter>::default();
        registry.register(
            "slot_denials",
            "Slot acquisitions denied for lack of capacity",
            slot_denials.clone(),
        );

        let frames_generated = Counter::default();
        registry.register(
            "frames_generated",
            "Frames served by stream sessions, placeholders included",
            frames_generated.clone(),
        );
        let frame_errors = Counter::default();
        registry.register(
            "frame_errors",
            "Frame source failures",
            frame_errors.clone(),
        );
        let frame_timeouts = Counter::default();
        registry.register(
            "frame_timeouts",
            "Frame source calls that timed out",
            frame_timeouts.clone(),
        );
        let degraded_sessions = Gauge::default();
        registry.register(
            "degraded_sessions",
            "Stream sessions currently serving placeholder frames",
            degraded_sessions.clone(),
        );

        let detection_invocations = Counter::default();
        registry.register(
            "detection_invocations",
            "Per-camera detection attempts",
            detection_invocations.clone(),
        );
        let capability_failures = Counter::default();
        registry.register(
            "capability_failures",
            "Detection attempts skipped after a capability failure",
            capability_failures.clone(),
        );
        let detections_found = Counter::default();
        registry.register(
            "detections_found",
            "Detection results written",
            detections_found.clone(),
        );

        let jobs_scheduled = Counter::default();
        registry.register("jobs_scheduled", "Detection jobs scheduled", jobs_scheduled.clone());
        let jobs_completed = Counter::default();
        registry.register("jobs_completed", "Detection jobs completed", jobs_completed.clone());
        let jobs_aborted = Counter::default();
        registry.register("jobs_aborted", "Detection jobs aborted", jobs_aborted.clone());
        let cycles_completed = Counter::default();
        registry.register(
            "cycles_completed",
            "Full automatic sweeps of the registry",
            cycles_completed.clone(),
        );

        Self {
            registry: Arc::new(registry),
            slots_in_use,
            slot_denials,
            frames_generated,
            frame_errors,
            frame_timeouts,
            degraded_sessions,
            detection_invocations,
            capability_failures,
            detections_found,
            jobs_scheduled,
            jobs_completed,
            jobs_aborted,
            cycles_completed,
        }
    }

    pub(crate) fn pool_labels(kind: PoolKind) -> PoolLabels {
        PoolLabels {
            pool: kind.as_str().to_string(),
        }
    }

    /// Render all series in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| Error::Config(format!("Failed to encode metrics: {}", e)))?;
        Ok(buffer)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
