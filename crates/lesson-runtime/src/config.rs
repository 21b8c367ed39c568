//! Runtime configuration, loadable from TOML.
//!
//! ```toml
//! [orchestrator]
//! user_id = "learner-7"
//! advance_delay_ms = 500
//!
//! [sandbox]
//! mount_timeout_ms = 8000
//!
//! [guardrails]
//! event_limit = 50
//!
//! [registry]
//! allowed_bundle_hosts = ["cdn.example.org"]
//! ```
//!
//! Every section and field is optional.

use std::path::Path;
use std::sync::Arc;

use lesson_store::{KvBackend, StoreLimits};
use serde::{Deserialize, Serialize};

use crate::builtin;
use crate::dom::Element;
use crate::error::{Result, RuntimeError};
use crate::event_bus::EventBus;
use crate::fetch::BundleFetcher;
use crate::guardrail::{GuardrailDefaults, ResourceProbe};
use crate::orchestrator::{LessonOrchestrator, OrchestratorConfig};
use crate::registry::{RegistryConfig, ScriptHost, TemplateRegistry};
use crate::sandbox::{SandboxConfig, SandboxManager};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorConfig,
    pub sandbox: SandboxConfig,
    pub guardrails: GuardrailDefaults,
    pub registry: RegistryConfig,
    pub storage: StoreLimits,
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RuntimeError::InvalidRuntimeConfig(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidRuntimeConfig(format!("{}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RuntimeError::InvalidRuntimeConfig(e.to_string()))
    }
}

/// External collaborators an orchestrator is wired to.
pub struct RuntimeParts {
    pub root: Element,
    pub bus: EventBus,
    pub store: Arc<dyn KvBackend>,
    pub fetcher: Arc<dyn BundleFetcher>,
    pub probe: Arc<dyn ResourceProbe>,
    pub script_host: Option<Arc<dyn ScriptHost>>,
}

/// Build a registry with the builtin templates registered, a sandbox over
/// it and an orchestrator mounting into `parts.root`.
pub fn build_orchestrator(config: &RuntimeConfig, parts: RuntimeParts) -> Result<LessonOrchestrator> {
    let document = parts.root.document().clone();
    let mut registry = TemplateRegistry::new(
        config.registry.clone(),
        document,
        builtin::catalog(),
        Arc::clone(&parts.fetcher),
    );
    if let Some(host) = parts.script_host {
        registry = registry.with_script_host(host);
    }
    builtin::register_builtins(&mut registry)?;

    let sandbox = SandboxManager::new(
        config.sandbox.clone(),
        config.guardrails.clone(),
        registry,
        parts.bus.clone(),
        parts.fetcher,
        parts.probe,
    );
    Ok(LessonOrchestrator::new(
        config.orchestrator.clone(),
        sandbox,
        parts.bus,
        parts.root,
        parts.store,
        config.storage,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = RuntimeConfig::from_toml_str(
            r#"
            [orchestrator]
            user_id = "learner-7"
            advance_delay_ms = 0

            [orchestrator.recovery]
            max_retries = 1

            [sandbox]
            mount_timeout_ms = 500

            [guardrails]
            event_limit = 5

            [registry]
            allowed_bundle_hosts = ["cdn.example.org"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.user_id, "learner-7");
        assert_eq!(cfg.orchestrator.advance_delay_ms, 0);
        assert_eq!(cfg.orchestrator.recovery.max_retries, 1);
        assert_eq!(cfg.orchestrator.theme, "light");
        assert_eq!(cfg.sandbox.mount_timeout_ms, 500);
        assert_eq!(cfg.sandbox.preload_timeout_ms, 10_000);
        assert_eq!(cfg.guardrails.event_limit, 5);
        assert_eq!(cfg.registry.allowed_bundle_hosts, vec!["cdn.example.org"]);
    }

    #[test]
    fn bad_toml_is_reported() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("[sandbox]\nmount_timeout_ms = \"soon\""),
            Err(RuntimeError::InvalidRuntimeConfig(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = RuntimeConfig::default();
        let raw = cfg.to_toml_string().unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&raw).unwrap(), cfg);
    }
}
