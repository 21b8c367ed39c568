//! Process-wide counters for the lesson runtime.
//!
//! Increment at the call site, call [`Metrics::flush`] at a natural boundary
//! (end of a lesson, end of a CLI command) to log the totals once.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    activities_mounted: AtomicU64,
    mount_failures: AtomicU64,
    guardrail_violations: AtomicU64,
    events_dispatched: AtomicU64,
    lessons_completed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub activities_mounted: u64,
    pub mount_failures: u64,
    pub guardrail_violations: u64,
    pub events_dispatched: u64,
    pub lessons_completed: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            activities_mounted: AtomicU64::new(0),
            mount_failures: AtomicU64::new(0),
            guardrail_violations: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            lessons_completed: AtomicU64::new(0),
        }
    }

    pub fn inc_activities_mounted(&self) {
        self.activities_mounted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "activities_mounted", "counter incremented");
    }

    pub fn inc_mount_failures(&self) {
        self.mount_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "mount_failures", "counter incremented");
    }

    pub fn inc_guardrail_violations(&self) {
        self.guardrail_violations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "guardrail_violations", "counter incremented");
    }

    /// Bumped once per `EventBus::emit`, not once per handler.
    pub fn inc_events_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lessons_completed(&self) {
        self.lessons_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "lessons_completed", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            activities_mounted: self.activities_mounted.load(Ordering::Relaxed),
            mount_failures: self.mount_failures.load(Ordering::Relaxed),
            guardrail_violations: self.guardrail_violations.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            lessons_completed: self.lessons_completed.load(Ordering::Relaxed),
        }
    }

    /// Log all counters as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            activities_mounted = s.activities_mounted,
            mount_failures = s.mount_failures,
            guardrail_violations = s.guardrail_violations,
            events_dispatched = s.events_dispatched,
            lessons_completed = s.lessons_completed,
        );
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        self.activities_mounted.store(0, Ordering::Relaxed);
        self.mount_failures.store(0, Ordering::Relaxed);
        self.guardrail_violations.store(0, Ordering::Relaxed);
        self.events_dispatched.store(0, Ordering::Relaxed);
        self.lessons_completed.store(0, Ordering::Relaxed);
    }
}
