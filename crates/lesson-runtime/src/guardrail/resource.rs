//! Resource guardrail: periodic heap and CPU sampling.
//!
//! Memory is judged by growth over the reading taken when the monitor first
//! starts, so a host that is already large does not flag every activity.
//! Overuse is reported as a host-level `resource-overuse` bus event and is
//! never raised to activity code. The sampling task is owned by the monitor
//! and aborted on `stop`, and on drop.

use std::fmt;
use std::hint::black_box;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::GuardrailViolation;
use crate::event_bus::{ActivityEvent, EventBus, EventType};
use crate::obs;

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Bytes in use, or `None` when the platform can't tell.
    fn heap_used_bytes(&self) -> Option<u64>;

    /// Wall time of a fixed unit of work. Slow when the host is saturated.
    fn cpu_probe(&self) -> Duration {
        synthetic_cpu_probe()
    }

    /// Best-effort hint to release memory.
    fn reclaim(&self) {}
}

const CPU_PROBE_ITERATIONS: u64 = 100_000;

pub fn synthetic_cpu_probe() -> Duration {
    let start = Instant::now();
    let mut acc = 0u64;
    for i in 0..CPU_PROBE_ITERATIONS {
        acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
    }
    black_box(acc);
    start.elapsed()
}

/// Resident set size from `/proc/self/statm`; `None` elsewhere.
///
/// This is the whole process, not one activity. The monitor only compares
/// growth since activation against an activity's memory limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatmProbe;

const PAGE_SIZE: u64 = 4096;

impl ResourceProbe for ProcStatmProbe {
    fn heap_used_bytes(&self) -> Option<u64> {
        let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident: u64 = raw.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident * PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceThresholds {
    pub max_memory_bytes: u64,
    pub max_cpu_probe: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub heap_bytes: Option<u64>,
    /// Growth over the baseline taken at first activation.
    pub heap_growth_bytes: Option<u64>,
    pub cpu_probe_us: u64,
    pub memory_exceeded: bool,
    pub cpu_exceeded: bool,
}

struct Sampler {
    activity_id: String,
    bus: EventBus,
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    baseline: Mutex<Option<u64>>,
}

impl Sampler {
    fn baseline(&self) -> MutexGuard<'_, Option<u64>> {
        self.baseline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the starting heap reading. Later calls keep the first one.
    fn capture_baseline(&self) {
        let mut baseline = self.baseline();
        if baseline.is_none() {
            *baseline = self.probe.heap_used_bytes();
        }
    }

    fn sample(&self) -> ResourceSample {
        let heap_bytes = self.probe.heap_used_bytes();
        let baseline = self.baseline().unwrap_or(0);
        let heap_growth_bytes = heap_bytes.map(|b| b.saturating_sub(baseline));
        let cpu = self.probe.cpu_probe();
        let memory_exceeded =
            heap_growth_bytes.is_some_and(|g| g > self.thresholds.max_memory_bytes);
        let cpu_exceeded = cpu > self.thresholds.max_cpu_probe;

        if memory_exceeded {
            let observed = heap_growth_bytes.unwrap_or_default();
            self.report("memory", observed, self.thresholds.max_memory_bytes);
            self.probe.reclaim();
        }
        if cpu_exceeded {
            self.report(
                "cpu",
                cpu.as_micros() as u64,
                self.thresholds.max_cpu_probe.as_micros() as u64,
            );
        }

        ResourceSample {
            heap_bytes,
            heap_growth_bytes,
            cpu_probe_us: cpu.as_micros() as u64,
            memory_exceeded,
            cpu_exceeded,
        }
    }

    fn report(&self, resource: &str, observed: u64, threshold: u64) {
        let violation = GuardrailViolation::ResourceOveruse {
            resource: resource.to_string(),
            observed,
            threshold,
        };
        obs::emit_guardrail_violation(&self.activity_id, &violation);
        self.bus.emit(
            ActivityEvent::new(EventType::ResourceOveruse, self.activity_id.clone()).with_payload(
                json!({
                    "resource": resource,
                    "observed": observed,
                    "threshold": threshold,
                    "message": violation.to_string(),
                }),
            ),
        );
    }
}

pub struct ResourceMonitor {
    sampler: Arc<Sampler>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("activity_id", &self.sampler.activity_id)
            .field("interval", &self.interval)
            .field("thresholds", &self.sampler.thresholds)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(
        activity_id: &str,
        bus: EventBus,
        probe: Arc<dyn ResourceProbe>,
        thresholds: ResourceThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            sampler: Arc::new(Sampler {
                activity_id: activity_id.to_string(),
                bus,
                probe,
                thresholds,
                baseline: Mutex::new(None),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the sampling task. No-op when already running or when called
    /// outside a tokio runtime. The first start fixes the memory baseline.
    pub fn start(&self) {
        self.sampler.capture_baseline();
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    activity_id = %self.sampler.activity_id,
                    "no async runtime; resource monitoring disabled"
                );
                return;
            }
        };
        let sampler = Arc::clone(&self.sampler);
        let period = self.interval.max(Duration::from_millis(1));
        *task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sampler.sample();
            }
        }));
        debug!(activity_id = %self.sampler.activity_id, ?period, "resource monitor started");
    }

    /// Abort the sampling task. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
            debug!(activity_id = %self.sampler.activity_id, "resource monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Take one reading now, emitting overuse events as the task would.
    pub fn sample_once(&self) -> ResourceSample {
        self.sampler.sample()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
