//! Lesson Runtime
//!
//! Loads third-party activity modules, isolates each one behind guardrails,
//! sequences them through a lesson, and aggregates their scores.
//!
//! ## Key Components
//!
//! - `EventBus`: typed publish/subscribe hub between modules and the host
//! - `TemplateRegistry`: versioned catalog of activity templates
//! - `GuardrailManager`: DOM scope, network quota, resource and event-rate
//!   limits for one activity
//! - `SandboxManager`: isolated container and timed lifecycle per activity
//! - `LessonOrchestrator`: the lesson state machine

pub mod builtin;
pub mod config;
pub mod dom;
pub mod error;
pub mod event_bus;
pub mod fetch;
pub mod guardrail;
pub mod lesson;
pub mod metrics;
pub mod module;
pub mod obs;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod telemetry;

pub use config::{build_orchestrator, RuntimeConfig, RuntimeParts};
pub use dom::{Document, DomEvent, Element, ListenerId};
pub use error::{Result, RuntimeError};
pub use event_bus::{ActivityEvent, EventBus, EventHandler, EventType, SubscriptionId};
pub use fetch::{BundleFetcher, FetchError, HttpBundleFetcher, StaticFetcher};
pub use guardrail::{
    GuardrailDefaults, GuardrailManager, GuardrailViolation, ProcStatmProbe, ResourceProbe,
};
pub use lesson::{
    ActivityStep, ConfigError, GradingMode, LessonConfig, LessonState, LessonStatus,
    LessonSummary,
};
pub use metrics::METRICS;
pub use module::{ActivityError, ActivityModule, ActivityResult};
pub use orchestrator::{
    LessonOrchestrator, LessonSignal, OrchestratorConfig, RecoveryLog, RecoveryPolicy,
};
pub use registry::{
    ActivityManifest, BundleLocation, Category, RegistryConfig, RegistryError, TemplateId,
    TemplateInfo, TemplateRegistry,
};
pub use sandbox::{ActivityContext, BaseContext, SandboxConfig, SandboxError, SandboxManager};
pub use telemetry::{init_tracing, level_for_verbosity};
