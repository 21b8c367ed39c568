//! Best-effort containment of one activity instance.
//!
//! Four independent policies: DOM scope and tag allowlist, network domain
//! allowlist and quota, periodic resource sampling, per-type event rate.
//! None of this is a security boundary; it keeps well-meaning but buggy
//! activities from trampling the host and each other.

mod dom;
mod error;
mod event_rate;
mod network;
mod resource;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use dom::{DomGuard, DEFAULT_ALLOWED_TAGS};
pub use error::GuardrailViolation;
pub use event_rate::EventRateLimiter;
pub use network::NetworkGuard;
pub use resource::{
    synthetic_cpu_probe, ProcStatmProbe, ResourceMonitor, ResourceProbe, ResourceSample,
    ResourceThresholds,
};

use crate::dom::Element;
use crate::event_bus::EventBus;
use crate::fetch::BundleFetcher;
use crate::obs;
use crate::registry::ActivityManifest;

/// Runtime-wide guardrail defaults; manifests override the per-template
/// parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailDefaults {
    pub event_limit: u32,
    pub event_window_ms: u64,
    pub monitor_interval_ms: u64,
    pub cpu_probe_threshold_ms: u64,
    /// Used when a manifest has no `performance.maxMemoryMB`.
    pub max_memory_mb: u64,
    /// Used when a manifest has no `security.maxApiCalls`.
    pub max_api_calls: u32,
    /// Empty means [`DEFAULT_ALLOWED_TAGS`].
    pub allowed_tags: Vec<String>,
}

impl Default for GuardrailDefaults {
    fn default() -> Self {
        Self {
            event_limit: 100,
            event_window_ms: 60_000,
            monitor_interval_ms: 5_000,
            cpu_probe_threshold_ms: 100,
            max_memory_mb: 50,
            max_api_calls: 10,
            allowed_tags: Vec::new(),
        }
    }
}

/// Effective limits for one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailPolicy {
    pub allowed_domains: Vec<String>,
    pub max_api_calls: u32,
    pub allowed_tags: Vec<String>,
    pub thresholds: ResourceThresholds,
    pub monitor_interval: Duration,
    pub event_limit: u32,
    pub event_window: Duration,
}

impl GuardrailPolicy {
    pub fn from_manifest(manifest: &ActivityManifest, defaults: &GuardrailDefaults) -> Self {
        let security = manifest.security.clone().unwrap_or_default();
        let max_memory_mb = manifest
            .performance
            .as_ref()
            .and_then(|p| p.max_memory_mb)
            .unwrap_or(defaults.max_memory_mb);
        Self {
            allowed_domains: security.allowed_domains,
            max_api_calls: security.max_api_calls.unwrap_or(defaults.max_api_calls),
            allowed_tags: defaults.allowed_tags.clone(),
            thresholds: ResourceThresholds {
                max_memory_bytes: max_memory_mb.saturating_mul(1024 * 1024),
                max_cpu_probe: Duration::from_millis(defaults.cpu_probe_threshold_ms),
            },
            monitor_interval: Duration::from_millis(defaults.monitor_interval_ms),
            event_limit: defaults.event_limit,
            event_window: Duration::from_millis(defaults.event_window_ms),
        }
    }
}

/// Bundles the four guards for one mounted activity.
#[derive(Debug)]
pub struct GuardrailManager {
    activity_id: String,
    dom: DomGuard,
    network: NetworkGuard,
    resources: ResourceMonitor,
    events: EventRateLimiter,
}

impl GuardrailManager {
    pub fn new(
        activity_id: &str,
        container: Element,
        policy: &GuardrailPolicy,
        bus: EventBus,
        fetcher: Arc<dyn BundleFetcher>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            dom: DomGuard::new(activity_id, container, &policy.allowed_tags),
            network: NetworkGuard::new(&policy.allowed_domains, policy.max_api_calls, fetcher),
            resources: ResourceMonitor::new(
                activity_id,
                bus,
                probe,
                policy.thresholds,
                policy.monitor_interval,
            ),
            events: EventRateLimiter::new(policy.event_limit, policy.event_window),
        }
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn dom(&self) -> &DomGuard {
        &self.dom
    }

    pub fn network(&self) -> &NetworkGuard {
        &self.network
    }

    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }

    /// Start resource monitoring.
    pub fn activate(&self) {
        self.resources.start();
    }

    /// Stop resource monitoring.
    pub fn deactivate(&self) {
        self.resources.stop();
    }

    /// Stop monitoring, strip tracked listeners, clear the container and
    /// reset the network and event counters.
    pub fn cleanup(&self) {
        self.deactivate();
        let stripped = self.dom.strip_listeners();
        self.dom.clear_container();
        self.network.reset();
        self.events.reset();
        debug!(activity_id = %self.activity_id, stripped, "guardrails cleaned up");
    }

    pub fn check_event_limit(&self, event_type: &str) -> bool {
        self.events.check(event_type)
    }

    /// Like [`check_event_limit`](Self::check_event_limit) but reports a
    /// refusal as a violation.
    pub fn enforce_event_limit(&self, event_type: &str) -> Result<(), GuardrailViolation> {
        if self.events.check(event_type) {
            return Ok(());
        }
        let violation = GuardrailViolation::EventRateExceeded {
            event_type: event_type.to_string(),
            limit: self.events.limit(),
            window_ms: self.events.window().as_millis() as u64,
        };
        obs::emit_guardrail_violation(&self.activity_id, &violation);
        Err(violation)
    }
}

impl Drop for GuardrailManager {
    fn drop(&mut self) {
        self.deactivate();
    }
}
