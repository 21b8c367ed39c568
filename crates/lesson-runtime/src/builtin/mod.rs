//! Reference templates shipped with the runtime.

pub mod flashcards;
pub mod quiz;

use std::sync::Arc;

use crate::module::ActivityModule;
use crate::registry::{BuiltinCatalog, RegistryResult, TemplateInfo, TemplateRegistry};

pub use flashcards::Flashcards;
pub use quiz::Quiz;

/// Factories for every builtin template, keyed by template name.
pub fn catalog() -> BuiltinCatalog {
    BuiltinCatalog::new()
        .with(
            quiz::NAME,
            Arc::new(|| Arc::new(Quiz::new()) as Arc<dyn ActivityModule>),
        )
        .with(
            flashcards::NAME,
            Arc::new(|| Arc::new(Flashcards::new()) as Arc<dyn ActivityModule>),
        )
}

/// Register the builtin manifests. The registry must have been built with
/// [`catalog`] for them to load.
pub fn register_builtins(registry: &mut TemplateRegistry) -> RegistryResult<()> {
    registry.register(TemplateInfo::builtin(quiz::manifest(), quiz::NAME))?;
    registry.register(TemplateInfo::builtin(flashcards::manifest(), flashcards::NAME))?;
    Ok(())
}
