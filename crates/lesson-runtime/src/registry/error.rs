//! Errors for the template registry.

use crate::fetch::FetchError;

use super::semver::Version;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),

    #[error("security policy rejected template: {0}")]
    SecurityPolicy(String),

    #[error("version conflict for {name}: {incoming} is not newer than registered {existing}")]
    VersionConflict {
        name: String,
        existing: Version,
        incoming: Version,
    },

    #[error("template not found: {0}")]
    NotFound(String),

    #[error("module {template_id} is missing required exports: {}", missing.join(", "))]
    ModuleInterface {
        template_id: String,
        missing: Vec<String>,
    },

    #[error("checksum mismatch for {template_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        template_id: String,
        expected: String,
        actual: String,
    },

    #[error("bundle fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("script evaluation failed for {template_id}: {reason}")]
    Script { template_id: String, reason: String },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
