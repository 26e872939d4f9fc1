//! ABOUTME: Batch selection for the automatic detection cycle
//! ABOUTME: Walks the registry order in fixed-size batches that never span the wrap boundary

use std::time::Duration;

use cw_core::CameraId;

/// Next contiguous batch of up to `batch_size` cameras starting at `cursor`.
///
/// The returned cursor is `(cursor + batch.len()) % order.len()`, so the last
/// batch of a sweep is short and the following one starts back at index 0. A
/// cursor past the end of a shrunken registry wraps to 0 first. An empty
/// registry yields an empty batch and leaves the cursor untouched.
///
/// ```
/// use cw_core::CameraId;
/// use cw_sched::cycle::next_batch;
///
/// let order: Vec<CameraId> = (1..=5).map(CameraId::new).collect();
/// let (batch, cursor) = next_batch(&order, 3, 4);
/// assert_eq!(batch, vec![CameraId::new(4), CameraId::new(5)]);
/// assert_eq!(cursor, 0);
/// ```
pub fn next_batch(order: &[CameraId], cursor: usize, batch_size: usize) -> (Vec<CameraId>, usize) {
    let total = order.len();
    if total == 0 {
        return (Vec::new(), cursor);
    }

    let start = if cursor >= total { 0 } else { cursor };
    let end = (start + batch_size.max(1)).min(total);
    (order[start..end].to_vec(), end % total)
}

/// Cursor position of the automatic cycle
#[derive(Debug, Clone)]
pub struct CycleState {
    cursor: usize,
    batch_size: usize,
    cycle_duration: Duration,
}

/// A batch selected from the cycle, not yet committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub start: usize,
    pub cameras: Vec<CameraId>,
    pub next_cursor: usize,
}

impl Batch {
    /// Whether committing this batch finishes a sweep of the registry
    pub fn closes_cycle(&self) -> bool {
        !self.cameras.is_empty() && self.next_cursor == 0
    }
}

impl CycleState {
    pub fn new(batch_size: usize, cycle_duration: Duration) -> Self {
        Self {
            cursor: 0,
            batch_size: batch_size.max(1),
            cycle_duration,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cycle_duration(&self) -> Duration {
        self.cycle_duration
    }

    /// Select the next batch without moving the cursor
    pub fn peek(&self, order: &[CameraId]) -> Batch {
        let start = if self.cursor >= order.len() { 0 } else { self.cursor };
        let (cameras, next_cursor) = next_batch(order, self.cursor, self.batch_size);
        Batch {
            start,
            cameras,
            next_cursor,
        }
    }

    /// Keep only the first `len` cameras of a batch, recomputing its cursor
    pub fn truncate(batch: &mut Batch, len: usize, total: usize) {
        if len < batch.cameras.len() && total > 0 {
            batch.cameras.truncate(len);
            batch.next_cursor = (batch.start + len) % total;
        }
    }

    pub fn commit(&mut self, next_cursor: usize) {
        self.cursor = next_cursor;
    }

    /// Select and commit in one step
    pub fn advance(&mut self, order: &[CameraId]) -> Vec<CameraId> {
        let batch = self.peek(order);
        if !batch.cameras.is_empty() {
            self.commit(batch.next_cursor);
        }
        batch.cameras
    }
}
