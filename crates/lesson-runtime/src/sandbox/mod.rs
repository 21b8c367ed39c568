//! Per-activity execution: isolated container, guardrails, restricted
//! context and a timed lifecycle.
//!
//! `execute` either leaves a fully mounted activity behind or nothing at
//! all: any failure tears down the half-built guardrails and renders an
//! error card in the parent before the error is returned.

mod container;
mod context;
mod error;
mod params;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

pub use container::{render_error, IsolatedContainer, ACTIVITY_ID_ATTR};
pub use context::{
    ActivityContext, AudioControl, BaseContext, PlaybackState, SandboxCapabilities,
    SecureEventBus,
};
pub use error::{SandboxError, SandboxResult};
pub use params::validate_params;

use crate::dom::Element;
use crate::event_bus::EventBus;
use crate::fetch::BundleFetcher;
use crate::guardrail::{GuardrailDefaults, GuardrailManager, GuardrailPolicy, ResourceProbe};
use crate::module::{ActivityModule, ActivityResult};
use crate::obs;
use crate::registry::{TemplateInfo, TemplateRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub preload_timeout_ms: u64,
    pub mount_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            preload_timeout_ms: 10_000,
            mount_timeout_ms: 15_000,
        }
    }
}

async fn with_timeout<T, F>(phase: &'static str, limit_ms: u64, fut: F) -> SandboxResult<T>
where
    F: Future<Output = SandboxResult<T>>,
{
    tokio::time::timeout(Duration::from_millis(limit_ms), fut)
        .await
        .map_err(|_| SandboxError::Timeout { phase, limit_ms })?
}

struct LiveActivity {
    template_id: String,
    module: Arc<dyn ActivityModule>,
    guard: Arc<GuardrailManager>,
    container: IsolatedContainer,
    events: SecureEventBus,
}

pub struct SandboxManager {
    config: SandboxConfig,
    guardrails: GuardrailDefaults,
    registry: TemplateRegistry,
    bus: EventBus,
    fetcher: Arc<dyn BundleFetcher>,
    probe: Arc<dyn ResourceProbe>,
    active: HashMap<String, LiveActivity>,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("active", &self.active_ids())
            .finish()
    }
}

impl SandboxManager {
    pub fn new(
        config: SandboxConfig,
        guardrails: GuardrailDefaults,
        registry: TemplateRegistry,
        bus: EventBus,
        fetcher: Arc<dyn BundleFetcher>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            config,
            guardrails,
            registry,
            bus,
            fetcher,
            probe,
            active: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Add a template to the owned registry.
    pub fn register_template(&mut self, info: TemplateInfo) -> SandboxResult<()> {
        self.registry.register(info)?;
        Ok(())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn is_active(&self, activity_id: &str) -> bool {
        self.active.contains_key(activity_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn guardrails_of(&self, activity_id: &str) -> Option<Arc<GuardrailManager>> {
        self.active.get(activity_id).map(|a| Arc::clone(&a.guard))
    }

    pub fn container_of(&self, activity_id: &str) -> Option<&IsolatedContainer> {
        self.active.get(activity_id).map(|a| &a.container)
    }

    /// Load `template_id` and mount it into a fresh container under `parent`.
    #[instrument(skip(self, parent, params, base), fields(activity_id = %base.activity_id))]
    pub async fn execute(
        &mut self,
        template_id: &str,
        parent: &Element,
        params: &Value,
        base: BaseContext,
    ) -> SandboxResult<()> {
        let activity_id = base.activity_id.clone();
        if self.is_active(&activity_id) {
            debug!("replacing live instance");
            self.unmount_activity(&activity_id).await?;
        }

        let started = Instant::now();
        let module = match self.registry.load_module(template_id).await {
            Ok(module) => module,
            Err(e) => {
                let e = SandboxError::from(e);
                self.fail(parent, &activity_id, template_id, &e);
                return Err(e);
            }
        };

        let container = IsolatedContainer::build(parent, &activity_id);
        let manifest = self
            .registry
            .get(template_id)
            .map(|info| info.manifest.clone())
            .unwrap_or_else(|| module.manifest().clone());
        let policy = GuardrailPolicy::from_manifest(&manifest, &self.guardrails);
        let guard = Arc::new(GuardrailManager::new(
            &activity_id,
            container.content.clone(),
            &policy,
            self.bus.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.probe),
        ));
        guard.activate();
        let context = ActivityContext::secure(&base, Arc::clone(&guard));
        let events = context.events.clone();

        let mounted = self
            .run_lifecycle(&module, template_id, &manifest, &container, params, context)
            .await;
        if let Err(e) = mounted {
            guard.cleanup();
            events.release();
            self.fail(parent, &activity_id, template_id, &e);
            return Err(e);
        }

        container.hide_overlay();
        self.registry.mark_mounted(template_id);
        self.active.insert(
            activity_id.clone(),
            LiveActivity {
                template_id: template_id.to_string(),
                module,
                guard,
                container,
                events,
            },
        );
        obs::emit_activity_mounted(
            &activity_id,
            template_id,
            started.elapsed().as_millis() as u64,
        );
        Ok(())
    }

    async fn run_lifecycle(
        &self,
        module: &Arc<dyn ActivityModule>,
        template_id: &str,
        manifest: &crate::registry::ActivityManifest,
        container: &IsolatedContainer,
        params: &Value,
        context: ActivityContext,
    ) -> SandboxResult<()> {
        validate_params(manifest.params_schema.as_ref(), params).map_err(|errors| {
            SandboxError::ParameterValidation {
                template_id: template_id.to_string(),
                errors,
            }
        })?;

        let activity_id = context.activity_id.clone();
        with_timeout("preload", self.config.preload_timeout_ms, async {
            module
                .preload(params)
                .await
                .map_err(|e| SandboxError::runtime(&activity_id, e))
        })
        .await?;
        with_timeout("mount", self.config.mount_timeout_ms, async {
            module
                .mount(&container.content, params, context)
                .await
                .map_err(|e| SandboxError::runtime(&activity_id, e))
        })
        .await
    }

    fn fail(&self, parent: &Element, activity_id: &str, template_id: &str, error: &SandboxError) {
        obs::emit_activity_failed(activity_id, template_id, error);
        render_error(parent, activity_id, template_id, &error.to_string(), &self.bus);
    }

    /// Tear down one activity. Every step runs even if an earlier one fails.
    #[instrument(skip(self))]
    pub async fn unmount_activity(&mut self, activity_id: &str) -> SandboxResult<()> {
        let live = self
            .active
            .remove(activity_id)
            .ok_or_else(|| SandboxError::NotMounted(activity_id.to_string()))?;

        if let Err(e) = live.module.unmount().await {
            warn!(activity_id, error = %e, "module unmount failed");
        }
        live.guard.cleanup();
        let released = live.events.release();
        live.container.remove();
        self.registry.mark_unmounted(&live.template_id);
        debug!(activity_id, released, "activity unmounted");
        Ok(())
    }

    fn live(&self, activity_id: &str) -> SandboxResult<&LiveActivity> {
        self.active
            .get(activity_id)
            .ok_or_else(|| SandboxError::NotMounted(activity_id.to_string()))
    }

    pub async fn pause_activity(&self, activity_id: &str) -> SandboxResult<()> {
        let live = self.live(activity_id)?;
        live.guard.deactivate();
        live.module
            .pause()
            .await
            .map_err(|e| SandboxError::runtime(activity_id, e))
    }

    pub async fn resume_activity(&self, activity_id: &str) -> SandboxResult<()> {
        let live = self.live(activity_id)?;
        live.module
            .resume()
            .await
            .map_err(|e| SandboxError::runtime(activity_id, e))?;
        live.guard.activate();
        Ok(())
    }

    pub async fn result_of(&self, activity_id: &str) -> SandboxResult<ActivityResult> {
        let live = self.live(activity_id)?;
        live.module
            .get_result()
            .await
            .map_err(|e| SandboxError::runtime(activity_id, e))
    }

    /// Unmount every live activity using `template_id`, then unregister it.
    pub async fn unregister_template(&mut self, template_id: &str) -> SandboxResult<()> {
        let users: Vec<String> = self
            .active
            .iter()
            .filter(|(_, live)| live.template_id == template_id)
            .map(|(id, _)| id.clone())
            .collect();
        for activity_id in users {
            self.unmount_activity(&activity_id).await?;
        }
        self.registry.unregister(template_id).await?;
        Ok(())
    }

    /// Unmount everything and empty the registry.
    pub async fn cleanup(&mut self) {
        for activity_id in self.active_ids() {
            if let Err(e) = self.unmount_activity(&activity_id).await {
                warn!(activity_id = %activity_id, error = %e, "cleanup unmount failed");
            }
        }
        self.registry.clear();
    }
}
