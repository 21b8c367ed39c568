//! Template manifests and catalog entries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RegistryError;
use super::semver::{TemplateId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Quiz,
    Game,
    Puzzle,
    Media,
    Interactive,
    Assessment,
}

impl FromStr for Category {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_ascii_lowercase()))
            .map_err(|_| RegistryError::ManifestValidation(format!("unknown category {s:?}")))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Quiz => "quiz",
            Category::Game => "game",
            Category::Puzzle => "puzzle",
            Category::Media => "media",
            Category::Interactive => "interactive",
            Category::Assessment => "assessment",
        };
        f.write_str(s)
    }
}

/// Input modalities a template supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Pointer,
    Keyboard,
    Touch,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PropertyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_api_calls: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_load_time_ms: Option<u64>,
    #[serde(rename = "maxMemoryMB", default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Accessibility {
    pub keyboard_navigable: bool,
    pub screen_reader: bool,
    pub high_contrast: bool,
    pub captions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityManifest {
    pub id: String,
    pub version: String,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_schema: Option<ParamsSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<Performance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<Accessibility>,
}

impl ActivityManifest {
    /// Bare manifest for `name@version`.
    pub fn minimal(name: &str, version: &str, category: Category) -> Self {
        Self {
            id: format!("{name}@{version}"),
            version: version.to_string(),
            name: name.to_string(),
            category,
            capabilities: BTreeSet::new(),
            description: None,
            params_schema: None,
            security: None,
            performance: None,
            accessibility: None,
        }
    }

    /// Parse untrusted manifest JSON. Shape errors (missing fields, unknown
    /// category) become `ManifestValidation`.
    pub fn from_json(raw: Value) -> Result<Self, RegistryError> {
        serde_json::from_value(raw).map_err(|e| RegistryError::ManifestValidation(e.to_string()))
    }

    /// Field-level checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<TemplateId, RegistryError> {
        let invalid = |msg: String| Err(RegistryError::ManifestValidation(msg));
        if self.id.trim().is_empty() {
            return invalid("missing id".into());
        }
        if self.name.trim().is_empty() {
            return invalid(format!("{}: missing name", self.id));
        }
        if self.version.trim().is_empty() {
            return invalid(format!("{}: missing version", self.id));
        }
        let template_id = TemplateId::parse(&self.id)
            .map_err(|e| RegistryError::ManifestValidation(e.to_string()))?;
        let version: Version = self
            .version
            .parse()
            .map_err(|e: super::semver::SemverError| {
                RegistryError::ManifestValidation(e.to_string())
            })?;
        if version != template_id.version {
            return invalid(format!(
                "{}: version {} does not match id",
                self.id, self.version
            ));
        }
        if let Some(schema) = &self.params_schema {
            if let Some(field) = schema
                .required
                .iter()
                .find(|f| !schema.properties.contains_key(*f))
            {
                return invalid(format!(
                    "{}: required param {field:?} has no property schema",
                    self.id
                ));
            }
        }
        Ok(template_id)
    }
}

/// Where a template's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BundleLocation {
    /// Compiled into the runtime, `builtin:<name>`.
    Builtin(String),
    Url(Url),
}

const BUILTIN_PREFIX: &str = "builtin:";

impl BundleLocation {
    /// Fetched URLs ending in `.js`/`.mjs` load as standard modules; other
    /// URLs are global-scoped bundles.
    pub fn is_module_script(&self) -> bool {
        match self {
            BundleLocation::Builtin(_) => false,
            BundleLocation::Url(url) => {
                let path = url.path();
                path.ends_with(".js") || path.ends_with(".mjs")
            }
        }
    }
}

impl FromStr for BundleLocation {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(BUILTIN_PREFIX) {
            if name.trim().is_empty() {
                return Err(RegistryError::SecurityPolicy(format!(
                    "builtin bundle {s:?} has no name"
                )));
            }
            return Ok(BundleLocation::Builtin(name.to_string()));
        }
        Url::parse(s)
            .map(BundleLocation::Url)
            .map_err(|e| RegistryError::SecurityPolicy(format!("bundle {s:?} is not a url: {e}")))
    }
}

impl TryFrom<String> for BundleLocation {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BundleLocation> for String {
    fn from(b: BundleLocation) -> Self {
        b.to_string()
    }
}

impl fmt::Display for BundleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleLocation::Builtin(name) => write!(f, "{BUILTIN_PREFIX}{name}"),
            BundleLocation::Url(url) => write!(f, "{url}"),
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub manifest: ActivityManifest,
    pub bundle: BundleLocation,
    /// Lowercase SHA-256 hex of the bundle bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub load_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl TemplateInfo {
    pub fn new(manifest: ActivityManifest, bundle: BundleLocation) -> Self {
        Self {
            manifest,
            bundle,
            checksum: None,
            load_count: 0,
            last_used: None,
        }
    }

    pub fn builtin(manifest: ActivityManifest, name: &str) -> Self {
        Self::new(manifest, BundleLocation::Builtin(name.to_string()))
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json() -> Value {
        json!({
            "id": "memory-match@1.2.0",
            "version": "1.2.0",
            "name": "Memory Match",
            "category": "game",
            "capabilities": ["pointer", "touch", "pointer"],
            "paramsSchema": {
                "required": ["pairs"],
                "properties": {
                    "pairs": {"type": "integer", "minimum": 2, "maximum": 12},
                    "theme": {"type": "string", "enum": ["animals", "shapes"]}
                }
            },
            "security": {"allowedDomains": ["cdn.example.com"], "maxApiCalls": 5},
            "performance": {"maxLoadTimeMs": 2000, "maxMemoryMB": 32},
            "accessibility": {"keyboardNavigable": true}
        })
    }

    #[test]
    fn parses_camel_case_manifest() {
        let m = ActivityManifest::from_json(manifest_json()).unwrap();
        assert_eq!(m.category, Category::Game);
        assert_eq!(m.capabilities.len(), 2);
        assert_eq!(m.performance.as_ref().unwrap().max_memory_mb, Some(32));
        let schema = m.params_schema.as_ref().unwrap();
        assert_eq!(schema.properties["pairs"].kind, Some(PropertyType::Integer));
        assert!(m.accessibility.as_ref().unwrap().keyboard_navigable);
        assert_eq!(m.validate().unwrap().global_name(), "__activity_memory_match_1_2_0");
    }

    #[test]
    fn unknown_category_is_a_manifest_error() {
        let mut raw = manifest_json();
        raw["category"] = json!("spreadsheet");
        assert!(matches!(
            ActivityManifest::from_json(raw),
            Err(RegistryError::ManifestValidation(_))
        ));
        assert!("Quiz".parse::<Category>().is_ok());
        assert!("spreadsheet".parse::<Category>().is_err());
    }

    #[test]
    fn version_must_match_id() {
        let mut m = ActivityManifest::from_json(manifest_json()).unwrap();
        m.version = "1.3.0".into();
        assert!(m.validate().is_err());

        m.version = "1.2".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn required_params_need_a_schema() {
        let mut m = ActivityManifest::from_json(manifest_json()).unwrap();
        m.params_schema.as_mut().unwrap().required.push("ghost".into());
        assert!(m.validate().is_err());
    }

    #[test]
    fn bundle_locations() {
        let b: BundleLocation = "builtin:quiz".parse().unwrap();
        assert_eq!(b, BundleLocation::Builtin("quiz".into()));
        assert_eq!(b.to_string(), "builtin:quiz");

        let m: BundleLocation = "https://cdn.example.com/quiz.mjs".parse().unwrap();
        assert!(m.is_module_script());
        let g: BundleLocation = "https://cdn.example.com/quiz.bundle".parse().unwrap();
        assert!(!g.is_module_script());

        assert!("builtin:".parse::<BundleLocation>().is_err());
        assert!("quiz.js".parse::<BundleLocation>().is_err());
    }
}
