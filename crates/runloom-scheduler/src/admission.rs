//! Work-queue admission counters.
//!
//! A flow run takes a slot on its queue when it enters Running and gives it
//! back when it leaves. Counters are plain atomics so the check and the
//! increment happen as one step; they live in a [`QueueSlots`] that the
//! orchestrator owns and passes around explicitly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use runloom_core::ids::WorkQueueId;

/// Running-slot counter for one queue.
#[derive(Debug, Default)]
pub struct AdmissionCounter {
    active: AtomicU32,
    total_admitted: AtomicU64,
}

impl AdmissionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot if fewer than `limit` are held. `None` is unlimited.
    pub fn try_admit(&self, limit: Option<u32>) -> bool {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| match limit {
                Some(limit) if active >= limit => None,
                _ => Some(active + 1),
            })
            .is_ok();
        if admitted {
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Take a slot regardless of the limit (administrative override).
    pub fn force_admit(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Give a slot back. Never goes below zero.
    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| active.checked_sub(1));
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_admitted(&self) -> u64 {
        self.total_admitted.load(Ordering::Relaxed)
    }

    /// Slots left under `limit`; `None` when unlimited.
    pub fn available(&self, limit: Option<u32>) -> Option<u32> {
        limit.map(|limit| limit.saturating_sub(self.active()))
    }
}

/// Admission counters keyed by queue.
#[derive(Debug, Default)]
pub struct QueueSlots {
    counters: Mutex<BTreeMap<WorkQueueId, Arc<AdmissionCounter>>>,
}

impl QueueSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `queue`, created empty on first use.
    pub fn counter(&self, queue: &WorkQueueId) -> Arc<AdmissionCounter> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(queue.clone())
            .or_insert_with(|| Arc::new(AdmissionCounter::new()))
            .clone()
    }

    /// Slots currently held on `queue`.
    pub fn active(&self, queue: &WorkQueueId) -> u32 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(queue).map(|c| c.active()).unwrap_or(0)
    }

    /// Rebuild counters from observed Running runs, e.g. after loading a
    /// snapshot. Replaces whatever was there.
    pub fn seed(&self, running: impl IntoIterator<Item = (WorkQueueId, u32)>) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.clear();
        for (queue, active) in running {
            let counter = AdmissionCounter::new();
            counter.active.store(active, Ordering::Release);
            counters.insert(queue, Arc::new(counter));
        }
    }

    /// `(queue, active)` for every known queue.
    pub fn stats(&self) -> Vec<(WorkQueueId, u32)> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .map(|(queue, counter)| (queue.clone(), counter.active()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_respects_limit() {
        let counter = AdmissionCounter::new();
        assert!(counter.try_admit(Some(2)));
        assert!(counter.try_admit(Some(2)));
        assert!(!counter.try_admit(Some(2)));
        assert_eq!(counter.active(), 2);
        counter.release();
        assert!(counter.try_admit(Some(2)));
        assert_eq!(counter.total_admitted(), 3);
    }

    #[test]
    fn test_unlimited_still_counts() {
        let counter = AdmissionCounter::new();
        for _ in 0..5 {
            assert!(counter.try_admit(None));
        }
        assert_eq!(counter.active(), 5);
        assert_eq!(counter.available(None), None);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let counter = AdmissionCounter::new();
        counter.release();
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn test_concurrent_admission_never_overshoots() {
        let counter = Arc::new(AdmissionCounter::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..100).filter(|_| counter.try_admit(Some(7))).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 7);
        assert_eq!(counter.active(), 7);
    }

    #[test]
    fn test_queue_slots_are_per_queue() {
        let slots = QueueSlots::new();
        let a = WorkQueueId::new("a");
        let b = WorkQueueId::new("b");
        assert!(slots.counter(&a).try_admit(Some(1)));
        assert!(slots.counter(&b).try_admit(Some(1)));
        assert!(!slots.counter(&a).try_admit(Some(1)));
        assert_eq!(slots.active(&a), 1);

        slots.seed([(a.clone(), 0)]);
        assert_eq!(slots.stats(), vec![(a, 0)]);
    }
}
