//! Device memory ownership and allocation tracking.
//!
//! [`DeviceBuffer`] is the only owner of device memory in this workspace: it
//! allocates through a [`ComputeBackend`] on construction and releases on
//! drop. Every allocation is recorded in the backend's [`MemoryTracker`] so
//! leaks show up as allocations that never return to baseline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::trace;

use crate::backend::ComputeBackend;
use crate::error::{check_len, Result};

/// A tracked device allocation.
#[derive(Debug, Clone)]
pub struct TrackedAllocation {
    /// Unique allocation ID.
    pub id: u64,
    /// Number of f64 elements.
    pub len: usize,
    /// Purpose of the buffer.
    pub label: String,
    /// Device index the buffer lives on.
    pub device_index: usize,
    /// Time when allocation was made.
    pub allocated_at: Instant,
}

impl TrackedAllocation {
    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryTrackerStats {
    /// Currently allocated bytes.
    pub current_bytes: u64,
    /// Peak allocated bytes.
    pub peak_bytes: u64,
    /// Total number of allocations (lifetime).
    pub total_allocations: u64,
    /// Total number of deallocations (lifetime).
    pub total_deallocations: u64,
    /// Current number of live allocations.
    pub active_allocations: usize,
}

/// Device memory tracker with leak detection.
pub struct MemoryTracker {
    allocations: RwLock<HashMap<u64, TrackedAllocation>>,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    next_id: AtomicU64,
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
}

impl MemoryTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            allocations: RwLock::new(HashMap::new()),
            current_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
        }
    }

    /// Record a new allocation and return its ID.
    pub fn track_alloc(&self, len: usize, label: &str, device_index: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let allocation = TrackedAllocation {
            id,
            len,
            label: label.to_string(),
            device_index,
            allocated_at: Instant::now(),
        };

        let size = allocation.size_bytes() as u64;
        let new_bytes = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(new_bytes, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        self.allocations.write().insert(id, allocation);
        id
    }

    /// Record the release of allocation `id`.
    pub fn track_free(&self, id: u64) -> Option<TrackedAllocation> {
        let allocation = self.allocations.write().remove(&id);
        if let Some(ref alloc) = allocation {
            self.current_bytes
                .fetch_sub(alloc.size_bytes() as u64, Ordering::Relaxed);
            self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        }
        allocation
    }

    /// Currently allocated bytes.
    pub fn current_usage(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Peak allocated bytes.
    pub fn peak_usage(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocations.read().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryTrackerStats {
        MemoryTrackerStats {
            current_bytes: self.current_usage(),
            peak_bytes: self.peak_usage(),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            active_allocations: self.allocation_count(),
        }
    }

    /// Live allocations older than `min_age_secs`, oldest first.
    pub fn detect_leaks(&self, min_age_secs: f64) -> Vec<TrackedAllocation> {
        let mut leaks: Vec<_> = self
            .allocations
            .read()
            .values()
            .filter(|a| a.allocated_at.elapsed().as_secs_f64() >= min_age_secs)
            .cloned()
            .collect();
        leaks.sort_by_key(|a| a.id);
        leaks
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusively owned region of device memory holding `len` f64 values.
///
/// There is no default state and no `Clone`: the buffer is released exactly
/// once, when its owner drops it.
pub struct DeviceBuffer<B: ComputeBackend> {
    raw: B::Buffer,
    len: usize,
    label: &'static str,
    device_id: Option<usize>,
    allocation_id: u64,
    tracker: Arc<MemoryTracker>,
}

impl<B: ComputeBackend> DeviceBuffer<B> {
    /// Allocate room for `len` f64 values on the backend's active device.
    pub fn new(backend: &B, len: usize, label: &'static str) -> Result<Self> {
        let raw = backend.allocate(len)?;
        let device_id = backend.active_device();
        let tracker = Arc::clone(backend.memory_tracker());
        let allocation_id = tracker.track_alloc(len, label, device_id.unwrap_or(0));
        trace!(
            "Allocated device buffer '{}' ({} doubles) on {}",
            label,
            len,
            backend.name()
        );

        Ok(Self {
            raw,
            len,
            label,
            device_id,
            allocation_id,
            tracker,
        })
    }

    /// Number of f64 elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Purpose of the buffer.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Device the buffer was allocated on.
    pub fn device_id(&self) -> Option<usize> {
        self.device_id
    }

    /// Backend handle, for kernel arguments.
    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    /// Mutable backend handle, for kernel outputs.
    pub fn raw_mut(&mut self) -> &mut B::Buffer {
        &mut self.raw
    }

    /// Copy `data` (exactly `len` values) to the device.
    pub fn upload(&mut self, backend: &B, data: &[f64]) -> Result<()> {
        check_len(self.label, data.len(), self.len)?;
        backend.copy_to_device(data, &mut self.raw)
    }

    /// Copy the device contents into `out` (exactly `len` values).
    pub fn download(&self, backend: &B, out: &mut [f64]) -> Result<()> {
        check_len(self.label, out.len(), self.len)?;
        backend.copy_to_host(&self.raw, out)
    }
}

impl<B: ComputeBackend> Drop for DeviceBuffer<B> {
    fn drop(&mut self) {
        self.tracker.track_free(self.allocation_id);
    }
}

impl<B: ComputeBackend> std::fmt::Debug for DeviceBuffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_alloc_free() {
        let tracker = MemoryTracker::new();
        let a = tracker.track_alloc(16, "mu", 0);
        let b = tracker.track_alloc(4, "chol", 0);

        assert_eq!(tracker.allocation_count(), 2);
        assert_eq!(tracker.current_usage(), 20 * 8);

        let freed = tracker.track_free(a).unwrap();
        assert_eq!(freed.label, "mu");
        assert_eq!(tracker.current_usage(), 4 * 8);
        assert_eq!(tracker.peak_usage(), 20 * 8);

        tracker.track_free(b);
        let stats = tracker.stats();
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 2);
        assert_eq!(stats.current_bytes, 0);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let tracker = MemoryTracker::new();
        let id = tracker.track_alloc(8, "ei", 0);
        assert!(tracker.track_free(id).is_some());
        assert!(tracker.track_free(id).is_none());
        assert_eq!(tracker.stats().total_deallocations, 1);
    }

    #[test]
    fn test_detect_leaks() {
        let tracker = MemoryTracker::new();
        let first = tracker.track_alloc(1, "first", 0);
        tracker.track_alloc(1, "second", 1);
        let leaks = tracker.detect_leaks(0.0);
        assert_eq!(leaks.len(), 2);
        assert_eq!(leaks[0].id, first);
        assert_eq!(leaks[1].device_index, 1);
    }
}
