mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::QuietProbe;
use lesson_runtime::guardrail::{GuardrailPolicy, NetworkGuard};
use lesson_runtime::registry::{BuiltinCatalog, Security};
use lesson_runtime::{
    ActivityContext, ActivityError, ActivityManifest, ActivityModule, ActivityResult,
    BaseContext, Category, Document, DomEvent, Element, EventBus, EventType, GuardrailDefaults,
    GuardrailManager, GuardrailViolation, RegistryConfig, SandboxConfig, SandboxManager,
    StaticFetcher, TemplateInfo, TemplateRegistry,
};
use lesson_store::{MemoryKvBackend, NamespacedStore, StoreLimits};
use serde_json::{json, Value};

const API: &str = "https://api.example.org/words";

#[test]
fn network_quota_refuses_the_call_after_the_limit() {
    let fetcher = Arc::new(StaticFetcher::new());
    let guard = NetworkGuard::new(&["example.org".to_string()], 3, fetcher);

    for _ in 0..3 {
        guard.check_request(API).unwrap();
    }
    assert_eq!(
        guard.check_request(API).unwrap_err(),
        GuardrailViolation::QuotaExceeded { limit: 3 }
    );
    assert_eq!(guard.request_count(), 3);

    // Local resources never count.
    guard.check_request("data:text/plain,hi").unwrap();
    guard.reset();
    guard.check_request(API).unwrap();
}

#[test]
fn network_guard_rejects_unlisted_hosts() {
    let guard = NetworkGuard::new(
        &["example.org".to_string()],
        10,
        Arc::new(StaticFetcher::new()),
    );
    assert!(matches!(
        guard.check_request("https://tracker.example.com/pixel"),
        Err(GuardrailViolation::DomainNotAllowed { .. })
    ));
    assert!(matches!(
        guard.check_request("ftp://example.org/file"),
        Err(GuardrailViolation::InvalidUrl { .. })
    ));
    assert_eq!(guard.request_count(), 0);
}

#[test]
fn dom_queries_never_escape_the_container() {
    let doc = Document::new();
    let host = doc.create_element("div");
    host.set_attribute("id", "host-banner");
    host.add_class("card");
    doc.body().append_child(&host);
    let container = doc.create_element("div");
    doc.body().append_child(&container);
    let inside = doc.create_element("p");
    inside.add_class("card");
    container.append_child(&inside);

    let manifest = ActivityManifest::minimal("probe", "1.0.0", Category::Interactive);
    let guard = GuardrailManager::new(
        "a1",
        container.clone(),
        &GuardrailPolicy::from_manifest(&manifest, &GuardrailDefaults::default()),
        EventBus::new(),
        Arc::new(StaticFetcher::new()),
        Arc::new(QuietProbe),
    );

    assert_eq!(guard.dom().query_selector_all(".card"), vec![inside]);
    assert!(guard.dom().get_element_by_id("host-banner").is_none());
    assert!(matches!(
        guard.dom().create_element("script"),
        Err(GuardrailViolation::TagNotAllowed { .. })
    ));
    assert_eq!(
        guard.dom().add_event_listener(&host, "click", Arc::new(|_: &DomEvent| {})),
        Err(GuardrailViolation::OutsideContainer)
    );
}

/// What the probing activity observed from inside the sandbox.
#[derive(Debug, Default)]
struct Observed {
    emits: Vec<bool>,
    host_visible: bool,
    fetches: Vec<Result<usize, String>>,
}

struct Probe {
    manifest: ActivityManifest,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl ActivityModule for Probe {
    fn manifest(&self) -> &ActivityManifest {
        &self.manifest
    }

    async fn mount(
        &self,
        _container: &Element,
        _params: &Value,
        ctx: ActivityContext,
    ) -> Result<(), ActivityError> {
        let host_visible = ctx.sandbox.get_element_by_id("host-banner").is_some();
        let emits: Vec<bool> = (0..5)
            .map(|i| ctx.emit(EventType::Progress, Some(json!({ "i": i }))).is_ok())
            .collect();
        let mut fetches = Vec::new();
        for _ in 0..3 {
            fetches.push(
                ctx.sandbox
                    .fetch(API)
                    .await
                    .map(|body| body.len())
                    .map_err(|e| e.to_string()),
            );
        }
        let mut observed = self.observed.lock().unwrap();
        observed.host_visible = host_visible;
        observed.emits = emits;
        observed.fetches = fetches;
        Ok(())
    }

    async fn unmount(&self) -> Result<(), ActivityError> {
        Ok(())
    }

    async fn get_result(&self) -> Result<ActivityResult, ActivityError> {
        Ok(ActivityResult::new(1.0, 0, Value::Null))
    }
}

#[tokio::test]
async fn activity_context_enforces_every_policy() {
    let doc = Document::new();
    let banner = doc.create_element("div");
    banner.set_attribute("id", "host-banner");
    doc.body().append_child(&banner);
    let root = doc.create_element("main");
    doc.body().append_child(&root);

    let observed = Arc::new(Mutex::new(Observed::default()));
    let o = Arc::clone(&observed);
    let mut manifest = ActivityManifest::minimal("probe", "1.0.0", Category::Interactive);
    manifest.security = Some(Security {
        allowed_domains: vec!["example.org".into()],
        max_api_calls: Some(2),
    });
    let module_manifest = manifest.clone();
    let catalog = BuiltinCatalog::new().with(
        "probe",
        Arc::new(move || {
            Arc::new(Probe {
                manifest: module_manifest.clone(),
                observed: Arc::clone(&o),
            }) as Arc<dyn ActivityModule>
        }),
    );

    let fetcher = Arc::new(StaticFetcher::new().with(API, b"[\"cat\"]".to_vec()));
    let mut registry =
        TemplateRegistry::new(RegistryConfig::default(), doc.clone(), catalog, fetcher.clone());
    registry
        .register(TemplateInfo::builtin(manifest, "probe"))
        .unwrap();

    let bus = EventBus::new();
    let mut sandbox = SandboxManager::new(
        SandboxConfig::default(),
        GuardrailDefaults {
            event_limit: 3,
            ..GuardrailDefaults::default()
        },
        registry,
        bus.clone(),
        fetcher.clone(),
        Arc::new(QuietProbe),
    );
    let base = BaseContext {
        lesson_id: "L1".into(),
        activity_id: "probe-1".into(),
        user_id: "u1".into(),
        locale: "en".into(),
        theme: "light".into(),
        bus: bus.clone(),
        storage: Arc::new(NamespacedStore::new(
            Arc::new(MemoryKvBackend::new()),
            "activity:u1:probe-1",
            StoreLimits::default(),
        )),
    };
    sandbox
        .execute("probe@1.0.0", &root, &Value::Null, base)
        .await
        .unwrap();

    let observed = observed.lock().unwrap();
    assert!(!observed.host_visible);
    assert_eq!(observed.emits, vec![true, true, true, false, false]);
    assert_eq!(bus.history_of(EventType::Progress).len(), 3);
    assert_eq!(observed.fetches[0], Ok(7));
    assert_eq!(observed.fetches[1], Ok(7));
    assert!(observed.fetches[2]
        .as_ref()
        .unwrap_err()
        .contains("quota exceeded"));
    assert_eq!(fetcher.requests().len(), 2);

    sandbox.unmount_activity("probe-1").await.unwrap();
    assert!(!sandbox.is_active("probe-1"));
    assert!(banner.is_connected());
}
