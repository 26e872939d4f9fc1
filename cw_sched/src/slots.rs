//! ABOUTME: Bounded streaming and detection slot pools with non-blocking acquisition
//! ABOUTME: Slots are single-use RAII handles released on drop or explicit release

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use cw_core::{Error, PoolKind, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::metrics::EngineMetrics;

#[derive(Debug)]
struct Pool {
    kind: PoolKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_use: AtomicUsize,
    metrics: EngineMetrics,
}

impl Pool {
    fn new(kind: PoolKind, capacity: usize, metrics: EngineMetrics) -> Self {
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: AtomicUsize::new(0),
            metrics,
        }
    }

    fn record_in_use(&self, in_use: usize) {
        self.metrics
            .slots_in_use
            .get_or_create(&EngineMetrics::pool_labels(self.kind))
            .set(in_use as i64);
    }
}

/// Point-in-time usage of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub in_use: usize,
    pub capacity: usize,
    pub available: usize,
}

/// Point-in-time usage of both pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUtilization {
    pub streaming: PoolUtilization,
    pub detection: PoolUtilization,
}

/// Ownership token for one slot. Dropping the handle returns the slot.
pub struct SlotHandle {
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl SlotHandle {
    pub fn kind(&self) -> PoolKind {
        self.pool.kind
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("pool", &self.pool.kind)
            .finish()
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let previous = self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "{} pool released more slots than were acquired",
            self.pool.kind
        );
        self.pool.record_in_use(previous - 1);
        debug!(pool = %self.pool.kind, in_use = previous - 1, "Released slot");
    }
}

/// The streaming and detection pools. Clones share the same pools.
#[derive(Debug, Clone)]
pub struct SlotPool {
    streaming: Arc<Pool>,
    detection: Arc<Pool>,
}

impl SlotPool {
    pub fn new(streaming_capacity: usize, detection_capacity: usize) -> Self {
        Self::with_metrics(streaming_capacity, detection_capacity, EngineMetrics::new())
    }

    pub fn with_metrics(
        streaming_capacity: usize,
        detection_capacity: usize,
        metrics: EngineMetrics,
    ) -> Self {
        let streaming = Pool::new(PoolKind::Streaming, streaming_capacity, metrics.clone());
        let detection = Pool::new(PoolKind::Detection, detection_capacity, metrics);
        streaming.record_in_use(0);
        detection.record_in_use(0);
        Self {
            streaming: Arc::new(streaming),
            detection: Arc::new(detection),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Arc<Pool> {
        match kind {
            PoolKind::Streaming => &self.streaming,
            PoolKind::Detection => &self.detection,
        }
    }

    /// Take one slot without waiting. Denial is final for this attempt and
    /// reports the pool's current usage.
    pub fn try_acquire(&self, kind: PoolKind) -> Result<SlotHandle> {
        let pool = self.pool(kind);
        match pool.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let in_use = pool.in_use.fetch_add(1, Ordering::AcqRel) + 1;
                assert!(
                    in_use <= pool.capacity,
                    "{} pool oversubscribed: {}/{}",
                    kind,
                    in_use,
                    pool.capacity
                );
                pool.record_in_use(in_use);
                debug!(pool = %kind, in_use, capacity = pool.capacity, "Acquired slot");
                Ok(SlotHandle {
                    pool: Arc::clone(pool),
                    _permit: permit,
                })
            }
            Err(TryAcquireError::NoPermits) => {
                pool.metrics
                    .slot_denials
                    .get_or_create(&EngineMetrics::pool_labels(kind))
                    .inc();
                let in_use = pool.capacity - pool.semaphore.available_permits().min(pool.capacity);
                warn!(pool = %kind, in_use, capacity = pool.capacity, "Slot request denied");
                Err(Error::CapacityExceeded {
                    pool: kind,
                    in_use,
                    capacity: pool.capacity,
                })
            }
            Err(TryAcquireError::Closed) => {
                Err(Error::InvalidState(format!("{} pool is closed", kind)))
            }
        }
    }

    /// Return a slot. The handle is consumed, so a slot cannot be released twice.
    pub fn release(&self, handle: SlotHandle) {
        debug_assert!(Arc::ptr_eq(self.pool(handle.kind()), &handle.pool));
        drop(handle);
    }

    pub fn available(&self, kind: PoolKind) -> usize {
        self.pool(kind).semaphore.available_permits()
    }

    pub fn in_use(&self, kind: PoolKind) -> usize {
        self.pool(kind).in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self, kind: PoolKind) -> usize {
        self.pool(kind).capacity
    }

    pub fn utilization(&self) -> SlotUtilization {
        let snapshot = |kind| PoolUtilization {
            in_use: self.in_use(kind),
            capacity: self.capacity(kind),
            available: self.available(kind),
        };
        SlotUtilization {
            streaming: snapshot(PoolKind::Streaming),
            detection: snapshot(PoolKind::Detection),
        }
    }
}
