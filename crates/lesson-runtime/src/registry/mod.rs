//! Template registry: the catalog of activity templates.
//!
//! Per id: unregistered → registered → loaded (cached) → unregistered.
//! Registration validates security policy, manifest shape and version
//! ordering before anything is stored. Loading resolves code through the
//! builtin table or the script host and caches the module only after it
//! passes the interface check.

mod error;
mod manifest;
mod resolver;
mod semver;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use lesson_store::ContentDigest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use error::{RegistryError, RegistryResult};
pub use manifest::{
    Accessibility, ActivityManifest, BundleLocation, Capability, Category, ParamsSchema,
    Performance, PropertySchema, PropertyType, Security, TemplateInfo,
};
pub use resolver::{
    BuiltinCatalog, BundleExports, ExportsFactory, HookFuture, LifecycleHook, LinkedScriptHost,
    ModuleFactory, MountHook, NoScriptHost, PreloadHook, ResultHook, ScriptHost,
};
pub use semver::{SemverError, TemplateId, Version};

use crate::dom::Document;
use crate::fetch::BundleFetcher;
use crate::module::ActivityModule;
use resolver::ScriptTag;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Hosts (and their subdomains) URL bundles may be served from.
    pub allowed_bundle_hosts: Vec<String>,
    /// Ceiling on a manifest's `security.allowedDomains` length.
    pub max_allowed_domains: usize,
    /// Ceiling on a manifest's `security.maxApiCalls`.
    pub max_api_calls_ceiling: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            allowed_bundle_hosts: Vec::new(),
            max_allowed_domains: 10,
            max_api_calls_ceiling: 1000,
        }
    }
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|a| {
        let a = a.to_ascii_lowercase();
        host == a || host.strip_suffix(a.as_str()).is_some_and(|p| p.ends_with('.'))
    })
}

pub struct TemplateRegistry {
    config: RegistryConfig,
    entries: HashMap<String, TemplateInfo>,
    cache: HashMap<String, Arc<dyn ActivityModule>>,
    mounted: HashMap<String, usize>,
    builtins: BuiltinCatalog,
    fetcher: Arc<dyn BundleFetcher>,
    script_host: Arc<dyn ScriptHost>,
    document: Document,
}

impl fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.entries.keys().collect();
        ids.sort();
        f.debug_struct("TemplateRegistry")
            .field("templates", &ids)
            .field("cached", &self.cache.len())
            .field("builtins", &self.builtins)
            .finish()
    }
}

impl TemplateRegistry {
    pub fn new(
        config: RegistryConfig,
        document: Document,
        builtins: BuiltinCatalog,
        fetcher: Arc<dyn BundleFetcher>,
    ) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            cache: HashMap::new(),
            mounted: HashMap::new(),
            builtins,
            fetcher,
            script_host: Arc::new(NoScriptHost),
            document,
        }
    }

    pub fn with_script_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.script_host = host;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn builtins(&self) -> &BuiltinCatalog {
        &self.builtins
    }

    fn check_security(&self, info: &TemplateInfo) -> RegistryResult<()> {
        if let BundleLocation::Url(url) = &info.bundle {
            let host = url.host_str().unwrap_or_default();
            if host.is_empty() || !host_allowed(host, &self.config.allowed_bundle_hosts) {
                return Err(RegistryError::SecurityPolicy(format!(
                    "bundle host {host:?} is not allowed"
                )));
            }
        }
        if let Some(security) = &info.manifest.security {
            if security.allowed_domains.len() > self.config.max_allowed_domains {
                return Err(RegistryError::SecurityPolicy(format!(
                    "{} allowed domains exceeds the limit of {}",
                    security.allowed_domains.len(),
                    self.config.max_allowed_domains
                )));
            }
            if let Some(calls) = security.max_api_calls {
                if calls > self.config.max_api_calls_ceiling {
                    return Err(RegistryError::SecurityPolicy(format!(
                        "maxApiCalls {calls} exceeds the limit of {}",
                        self.config.max_api_calls_ceiling
                    )));
                }
            }
        }
        if let Some(checksum) = &info.checksum {
            if ContentDigest::try_from(checksum.to_ascii_lowercase()).is_err() {
                return Err(RegistryError::SecurityPolicy(format!(
                    "checksum {checksum:?} is not a sha-256 hex digest"
                )));
            }
        }
        Ok(())
    }

    /// Newest registered version of template `name`, if any.
    fn newest_version(&self, name: &str) -> Option<Version> {
        self.entries
            .keys()
            .filter_map(|id| TemplateId::parse(id).ok())
            .filter(|id| id.name == name)
            .map(|id| id.version)
            .max()
    }

    /// Validate and add a template. Nothing is stored on failure.
    #[instrument(skip(self, info), fields(template_id = %info.manifest.id))]
    pub fn register(&mut self, info: TemplateInfo) -> RegistryResult<()> {
        self.check_security(&info)?;
        let template_id = info.manifest.validate()?;
        if let Some(existing) = self.newest_version(&template_id.name) {
            if template_id.version <= existing {
                return Err(RegistryError::VersionConflict {
                    name: template_id.name,
                    existing,
                    incoming: template_id.version,
                });
            }
        }
        let info = TemplateInfo {
            load_count: 0,
            last_used: None,
            checksum: info.checksum.map(|c| c.to_ascii_lowercase()),
            ..info
        };
        info!(bundle = %info.bundle, "template registered");
        self.entries.insert(template_id.to_string(), info);
        Ok(())
    }

    /// Remove a template. A mounted instance is unmounted first; a failing
    /// unmount is logged and removal continues.
    #[instrument(skip(self))]
    pub async fn unregister(&mut self, id: &str) -> RegistryResult<()> {
        if !self.entries.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        if self.is_mounted(id) {
            if let Some(module) = self.cache.get(id) {
                if let Err(e) = module.unmount().await {
                    warn!(template_id = %id, error = %e, "unmount during unregister failed");
                }
            }
        }
        self.mounted.remove(id);
        self.cache.remove(id);
        self.entries.remove(id);
        info!(template_id = %id, "template unregistered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TemplateInfo> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entries, optionally filtered by category, most recently used first.
    /// Never-used entries come last, ordered by id.
    pub fn list(&self, category: Option<Category>) -> Vec<&TemplateInfo> {
        let mut out: Vec<&TemplateInfo> = self
            .entries
            .values()
            .filter(|info| category.map_or(true, |c| info.manifest.category == c))
            .collect();
        out.sort_by(|a, b| {
            b.last_used
                .cmp(&a.last_used)
                .then_with(|| a.manifest.id.cmp(&b.manifest.id))
        });
        out
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    fn touch(&mut self, id: &str) {
        if let Some(info) = self.entries.get_mut(id) {
            info.load_count += 1;
            info.last_used = Some(Utc::now());
        }
    }

    /// Resolve, check and cache the module for `id`.
    #[instrument(skip(self, id), fields(template_id = %id))]
    pub async fn load_module(&mut self, id: &str) -> RegistryResult<Arc<dyn ActivityModule>> {
        if let Some(module) = self.cache.get(id).cloned() {
            self.touch(id);
            debug!("module served from cache");
            return Ok(module);
        }
        let info = self
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let module = self.resolve(&info).await?;
        self.cache.insert(id.to_string(), Arc::clone(&module));
        self.touch(id);
        info!(bundle = %info.bundle, "module loaded");
        Ok(module)
    }

    async fn resolve(&self, info: &TemplateInfo) -> RegistryResult<Arc<dyn ActivityModule>> {
        let id = info.id();
        let url = match &info.bundle {
            BundleLocation::Builtin(name) => {
                return self
                    .builtins
                    .instantiate(name)
                    .ok_or_else(|| RegistryError::NotFound(format!("builtin:{name}")));
            }
            BundleLocation::Url(url) => url,
        };

        let source = self.fetcher.fetch(url).await?;
        if let Some(expected) = &info.checksum {
            let actual = ContentDigest::from_bytes(&source);
            if actual.as_str() != expected {
                return Err(RegistryError::ChecksumMismatch {
                    template_id: id.to_string(),
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }
            debug!(digest = %actual.short(), "bundle checksum verified");
        }

        let script_error = |reason: String| RegistryError::Script {
            template_id: id.to_string(),
            reason,
        };
        let exports = if info.bundle.is_module_script() {
            self.script_host
                .import_module(url, &source)
                .await
                .map_err(script_error)?
        } else {
            let global = TemplateId::parse(id)
                .map_err(|e| RegistryError::ManifestValidation(e.to_string()))?
                .global_name();
            let script = self.document.create_element("script");
            script.set_attribute("data-template-id", id);
            script.set_attribute("src", url.as_str());
            self.document.head().append_child(&script);
            let tag = ScriptTag(script);
            let outcome = self
                .script_host
                .evaluate_global(&tag.0, &source, &global)
                .await;
            drop(tag);
            outcome
                .map_err(script_error)?
                .ok_or_else(|| script_error(format!("bundle did not define {global}")))?
        };
        exports.into_module(id)
    }

    /// Record a live mount of `id`.
    pub fn mark_mounted(&mut self, id: &str) {
        *self.mounted.entry(id.to_string()).or_default() += 1;
    }

    pub fn mark_unmounted(&mut self, id: &str) {
        if let Some(count) = self.mounted.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.mounted.remove(id);
            }
        }
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounted.get(id).is_some_and(|n| *n > 0)
    }

    /// Drop every entry, cached module and mount record.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cache.clear();
        self.mounted.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
