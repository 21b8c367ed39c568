#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lesson_runtime::guardrail::ResourceProbe;
use lesson_runtime::registry::BuiltinCatalog;
use lesson_runtime::{
    ActivityContext, ActivityError, ActivityManifest, ActivityModule, ActivityResult, Category,
    Document, Element, EventBus, GuardrailDefaults, LessonOrchestrator, OrchestratorConfig,
    RecoveryPolicy, RegistryConfig, SandboxConfig, SandboxManager, StaticFetcher, TemplateInfo,
    TemplateRegistry,
};
use lesson_store::{MemoryKvBackend, StoreLimits};
use serde_json::{json, Value};

/// Probe that never reports overuse, so timing-sensitive tests stay quiet.
pub struct QuietProbe;

impl ResourceProbe for QuietProbe {
    fn heap_used_bytes(&self) -> Option<u64> {
        None
    }

    fn cpu_probe(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Default)]
pub struct Calls {
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    /// Mount attempts left to fail before succeeding.
    pub failing_mounts: AtomicUsize,
}

impl Calls {
    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    pub fn fail_next_mounts(&self, n: usize) {
        self.failing_mounts.store(n, Ordering::SeqCst);
    }
}

/// Activity that always reports a fixed score.
pub struct Fixed {
    manifest: ActivityManifest,
    score: f64,
    fail_unmount: bool,
    calls: Arc<Calls>,
}

impl Fixed {
    pub fn new(name: &str, score: f64, calls: Arc<Calls>) -> Self {
        Self {
            manifest: ActivityManifest::minimal(name, "1.0.0", Category::Game),
            score,
            fail_unmount: false,
            calls,
        }
    }

    pub fn failing_unmount(mut self) -> Self {
        self.fail_unmount = true;
        self
    }
}

#[async_trait]
impl ActivityModule for Fixed {
    fn manifest(&self) -> &ActivityManifest {
        &self.manifest
    }

    async fn mount(
        &self,
        container: &Element,
        _params: &Value,
        ctx: ActivityContext,
    ) -> Result<(), ActivityError> {
        let remaining = self.calls.failing_mounts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.calls.failing_mounts.store(remaining - 1, Ordering::SeqCst);
            return Err(ActivityError::runtime("flaky mount"));
        }
        let marker = ctx.sandbox.create_element("p")?;
        marker.set_text(&self.manifest.name);
        container.append_child(&marker);
        self.calls.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount(&self) -> Result<(), ActivityError> {
        self.calls.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount {
            return Err(ActivityError::runtime("unmount failed"));
        }
        Ok(())
    }

    async fn get_result(&self) -> Result<ActivityResult, ActivityError> {
        Ok(ActivityResult::new(self.score, 25, json!({ "fixed": true })))
    }
}

pub fn fixed_catalog(templates: &[(&str, f64)], calls: &Arc<Calls>) -> BuiltinCatalog {
    let mut catalog = BuiltinCatalog::new();
    for (name, score) in templates {
        let name_owned = name.to_string();
        let score = *score;
        let calls = Arc::clone(calls);
        catalog.insert(
            name,
            Arc::new(move || {
                Arc::new(Fixed::new(&name_owned, score, Arc::clone(&calls))) as Arc<dyn ActivityModule>
            }),
        );
    }
    catalog
}

pub struct Harness {
    pub doc: Document,
    pub root: Element,
    pub bus: EventBus,
    pub backend: Arc<MemoryKvBackend>,
    pub calls: Arc<Calls>,
    pub orchestrator: LessonOrchestrator,
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        advance_delay_ms: 0,
        recovery: RecoveryPolicy {
            max_retries: 3,
            retry_delay_ms: 0,
        },
        user_id: "learner-1".into(),
        ..OrchestratorConfig::default()
    }
}

/// Orchestrator over `Fixed` templates registered as `<name>@1.0.0`.
pub fn harness(templates: &[(&str, f64)]) -> Harness {
    harness_with(templates, orchestrator_config())
}

pub fn harness_with(templates: &[(&str, f64)], config: OrchestratorConfig) -> Harness {
    let doc = Document::new();
    let root = doc.create_element("main");
    doc.body().append_child(&root);
    let bus = EventBus::new();
    let calls = Arc::new(Calls::default());
    let fetcher = Arc::new(StaticFetcher::new());

    let mut registry = TemplateRegistry::new(
        RegistryConfig::default(),
        doc.clone(),
        fixed_catalog(templates, &calls),
        fetcher.clone(),
    );
    for (name, _) in templates {
        registry
            .register(TemplateInfo::builtin(
                ActivityManifest::minimal(name, "1.0.0", Category::Game),
                name,
            ))
            .unwrap();
    }
    let sandbox = SandboxManager::new(
        SandboxConfig::default(),
        GuardrailDefaults::default(),
        registry,
        bus.clone(),
        fetcher,
        Arc::new(QuietProbe),
    );
    let backend = Arc::new(MemoryKvBackend::new());
    let orchestrator = LessonOrchestrator::new(
        config,
        sandbox,
        bus.clone(),
        root.clone(),
        backend.clone(),
        StoreLimits::default(),
    );
    Harness {
        doc,
        root,
        bus,
        backend,
        calls,
        orchestrator,
    }
}
