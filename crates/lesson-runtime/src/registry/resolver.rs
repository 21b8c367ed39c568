//! Turning a catalog entry into a live `ActivityModule`.
//!
//! Three sources, tried by bundle kind:
//! - `builtin:<name>`: factories compiled into the runtime
//! - `.js`/`.mjs` URLs: fetched and imported as a standard module by the
//!   [`ScriptHost`]
//! - any other URL: a global-scoped bundle evaluated by the [`ScriptHost`]
//!   while a temporary `<script>` element sits in the document head
//!
//! Script hosts hand back [`BundleExports`], a table of optional hooks that
//! must be checked for the required exports before it becomes a module.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::Value;

use super::error::{RegistryError, RegistryResult};
use super::manifest::ActivityManifest;
use crate::dom::Element;
use crate::module::{ActivityError, ActivityModule, ActivityResult};
use crate::sandbox::ActivityContext;

pub type HookFuture<T> = BoxFuture<'static, Result<T, ActivityError>>;
pub type PreloadHook = Arc<dyn Fn(Value) -> HookFuture<()> + Send + Sync>;
pub type MountHook = Arc<dyn Fn(Element, Value, ActivityContext) -> HookFuture<()> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn() -> HookFuture<()> + Send + Sync>;
pub type ResultHook = Arc<dyn Fn() -> HookFuture<ActivityResult> + Send + Sync>;

/// Exports object produced by a script bundle.
#[derive(Clone, Default)]
pub struct BundleExports {
    pub manifest: Option<ActivityManifest>,
    pub preload: Option<PreloadHook>,
    pub mount: Option<MountHook>,
    pub unmount: Option<LifecycleHook>,
    pub get_result: Option<ResultHook>,
    pub pause: Option<LifecycleHook>,
    pub resume: Option<LifecycleHook>,
}

impl fmt::Debug for BundleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleExports")
            .field("manifest", &self.manifest.as_ref().map(|m| &m.id))
            .field("missing", &self.missing_exports())
            .finish()
    }
}

impl BundleExports {
    /// Names of required exports this bundle lacks.
    pub fn missing_exports(&self) -> Vec<String> {
        [
            ("manifest", self.manifest.is_some()),
            ("mount", self.mount.is_some()),
            ("unmount", self.unmount.is_some()),
            ("getResult", self.get_result.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| name.to_string())
        .collect()
    }

    pub fn into_module(self, template_id: &str) -> RegistryResult<Arc<dyn ActivityModule>> {
        let missing = self.missing_exports();
        match (self.manifest, self.mount, self.unmount, self.get_result) {
            (Some(manifest), Some(mount), Some(unmount), Some(get_result)) => {
                Ok(Arc::new(ExportsModule {
                    manifest,
                    preload: self.preload,
                    mount,
                    unmount,
                    get_result,
                    pause: self.pause,
                    resume: self.resume,
                }))
            }
            _ => Err(RegistryError::ModuleInterface {
                template_id: template_id.to_string(),
                missing,
            }),
        }
    }
}

struct ExportsModule {
    manifest: ActivityManifest,
    preload: Option<PreloadHook>,
    mount: MountHook,
    unmount: LifecycleHook,
    get_result: ResultHook,
    pause: Option<LifecycleHook>,
    resume: Option<LifecycleHook>,
}

#[async_trait]
impl ActivityModule for ExportsModule {
    fn manifest(&self) -> &ActivityManifest {
        &self.manifest
    }

    async fn preload(&self, params: &Value) -> Result<(), ActivityError> {
        match &self.preload {
            Some(hook) => hook(params.clone()).await,
            None => Ok(()),
        }
    }

    async fn mount(
        &self,
        container: &Element,
        params: &Value,
        context: ActivityContext,
    ) -> Result<(), ActivityError> {
        (self.mount)(container.clone(), params.clone(), context).await
    }

    async fn unmount(&self) -> Result<(), ActivityError> {
        (self.unmount)().await
    }

    async fn get_result(&self) -> Result<ActivityResult, ActivityError> {
        (self.get_result)().await
    }

    async fn pause(&self) -> Result<(), ActivityError> {
        match &self.pause {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }

    async fn resume(&self) -> Result<(), ActivityError> {
        match &self.resume {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }
}

pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn ActivityModule> + Send + Sync>;

/// Modules compiled into the runtime, keyed by builtin name.
#[derive(Clone, Default)]
pub struct BuiltinCatalog {
    factories: BTreeMap<String, ModuleFactory>,
}

impl fmt::Debug for BuiltinCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, factory: ModuleFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn with(mut self, name: &str, factory: ModuleFactory) -> Self {
        self.insert(name, factory);
        self
    }

    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn ActivityModule>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Executes fetched bundle code on behalf of the registry.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Import `source` as a standard module and return its exports.
    async fn import_module(&self, url: &Url, source: &[u8]) -> Result<BundleExports, String>;

    /// Evaluate a global-scoped bundle while `script` is attached to the
    /// document, then read `global_name`. `Ok(None)` when the bundle did not
    /// define it.
    async fn evaluate_global(
        &self,
        script: &Element,
        source: &[u8],
        global_name: &str,
    ) -> Result<Option<BundleExports>, String>;
}

/// Refuses every bundle; the default when only builtins are expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScriptHost;

#[async_trait]
impl ScriptHost for NoScriptHost {
    async fn import_module(&self, url: &Url, _source: &[u8]) -> Result<BundleExports, String> {
        Err(format!("no script host configured to import {url}"))
    }

    async fn evaluate_global(
        &self,
        _script: &Element,
        _source: &[u8],
        global_name: &str,
    ) -> Result<Option<BundleExports>, String> {
        Err(format!("no script host configured to evaluate {global_name}"))
    }
}

pub type ExportsFactory = Arc<dyn Fn() -> BundleExports + Send + Sync>;

/// Script host backed by exports linked into the process ahead of time.
///
/// Module imports resolve by URL, global bundles by the global name they
/// would assign. Every call is recorded so callers can check what ran.
#[derive(Default)]
pub struct LinkedScriptHost {
    modules: HashMap<String, ExportsFactory>,
    globals: HashMap<String, ExportsFactory>,
    evaluations: Mutex<Vec<String>>,
}

impl fmt::Debug for LinkedScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedScriptHost")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LinkedScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_module(mut self, url: &str, factory: ExportsFactory) -> Self {
        self.modules.insert(url.to_string(), factory);
        self
    }

    pub fn link_global(mut self, global_name: &str, factory: ExportsFactory) -> Self {
        self.globals.insert(global_name.to_string(), factory);
        self
    }

    /// URLs and global names evaluated so far, in order.
    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, what: &str) {
        self.evaluations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(what.to_string());
    }
}

#[async_trait]
impl ScriptHost for LinkedScriptHost {
    async fn import_module(&self, url: &Url, _source: &[u8]) -> Result<BundleExports, String> {
        self.record(url.as_str());
        self.modules
            .get(url.as_str())
            .map(|factory| factory())
            .ok_or_else(|| format!("no module linked for {url}"))
    }

    async fn evaluate_global(
        &self,
        script: &Element,
        _source: &[u8],
        global_name: &str,
    ) -> Result<Option<BundleExports>, String> {
        if !script.is_connected() {
            return Err("script element is not attached".into());
        }
        self.record(global_name);
        Ok(self.globals.get(global_name).map(|factory| factory()))
    }
}

/// Removes the temporary `<script>` element however evaluation ends.
pub(crate) struct ScriptTag(pub(crate) Element);

impl Drop for ScriptTag {
    fn drop(&mut self) {
        self.0.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Category;
    use futures::FutureExt;

    pub(crate) fn complete_exports() -> BundleExports {
        BundleExports {
            manifest: Some(ActivityManifest::minimal("ext", "1.0.0", Category::Media)),
            mount: Some(Arc::new(|_: Element, _: Value, _: ActivityContext| {
                async { Ok::<_, ActivityError>(()) }.boxed()
            })),
            unmount: Some(Arc::new(|| async { Ok::<_, ActivityError>(()) }.boxed())),
            get_result: Some(Arc::new(|| {
                async { Ok::<_, ActivityError>(ActivityResult::new(1.0, 10, Value::Null)) }.boxed()
            })),
            ..BundleExports::default()
        }
    }

    #[test]
    fn complete_exports_become_a_module() {
        let module = complete_exports().into_module("ext@1.0.0").unwrap();
        assert_eq!(module.manifest().id, "ext@1.0.0");
    }

    #[test]
    fn missing_exports_are_reported_together() {
        let exports = BundleExports {
            mount: None,
            get_result: None,
            ..complete_exports()
        };
        match exports.into_module("ext@1.0.0") {
            Err(RegistryError::ModuleInterface { missing, .. }) => {
                assert_eq!(missing, vec!["mount".to_string(), "getResult".to_string()])
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("incomplete exports accepted"),
        }
    }

    #[tokio::test]
    async fn exports_module_delegates_to_hooks() {
        let module = complete_exports().into_module("ext@1.0.0").unwrap();
        module.preload(&Value::Null).await.unwrap();
        module.pause().await.unwrap();
        assert_eq!(module.get_result().await.unwrap().score, 1.0);
    }

    #[test]
    fn script_tag_removes_element_on_drop() {
        let doc = crate::dom::Document::new();
        let script = doc.create_element("script");
        doc.head().append_child(&script);
        {
            let _tag = ScriptTag(script.clone());
        }
        assert!(!script.exists());
    }
}
