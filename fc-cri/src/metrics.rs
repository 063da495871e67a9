//! Runtime-wide counters.
//!
//! Monotonic atomics shared across components; pool traffic counters live in
//! the pool itself. There is no exporter here - callers read a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counter storage. Cloning is cheap (Arc pointers only).
#[derive(Clone, Default)]
pub struct RuntimeMetrics {
    vms_created: Arc<AtomicU64>,
    vms_destroyed: Arc<AtomicU64>,
    vm_create_errors: Arc<AtomicU64>,
    agent_connect_errors: Arc<AtomicU64>,
    containers_created: Arc<AtomicU64>,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub vms_created: u64,
    pub vms_destroyed: u64,
    pub vm_create_errors: u64,
    pub agent_connect_errors: u64,
    pub containers_created: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_vms_created(&self) {
        self.vms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vms_destroyed(&self) {
        self.vms_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vm_create_errors(&self) {
        self.vm_create_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agent_connect_errors(&self) {
        self.agent_connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_containers_created(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            vms_created: self.vms_created.load(Ordering::Relaxed),
            vms_destroyed: self.vms_destroyed.load(Ordering::Relaxed),
            vm_create_errors: self.vm_create_errors.load(Ordering::Relaxed),
            agent_connect_errors: self.agent_connect_errors.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RuntimeMetrics::new();
        metrics.inc_vms_created();
        metrics.inc_vms_created();
        metrics.inc_vms_destroyed();

        let snap = metrics.snapshot();
        assert_eq!(snap.vms_created, 2);
        assert_eq!(snap.vms_destroyed, 1);
        assert_eq!(snap.vm_create_errors, 0);
    }

    #[test]
    fn clones_share_storage() {
        let metrics = RuntimeMetrics::new();
        let clone = metrics.clone();
        clone.inc_containers_created();
        assert_eq!(metrics.snapshot().containers_created, 1);
    }
}
