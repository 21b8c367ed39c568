//! Lesson CLI
//!
//! The `lesson` command checks lesson files, lists the builtin templates and
//! plays a lesson headlessly against scripted learner responses.
//!
//! ## Commands
//!
//! - `validate`: Check a lesson file without running it
//! - `templates`: List the templates the runtime ships with
//! - `run`: Play a lesson end to end and print its summary

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lesson_runtime::lesson::validate_all;
use lesson_runtime::obs::{lesson_span, LessonSpan};
use lesson_runtime::registry::Category;
use lesson_runtime::{
    build_orchestrator, builtin, init_tracing, level_for_verbosity, Document, EventBus,
    HttpBundleFetcher, LessonConfig, LessonStatus, LessonSummary, ProcStatmProbe, RuntimeConfig,
    RuntimeParts, StaticFetcher, TemplateRegistry, METRICS,
};
use lesson_store::{FileKvBackend, KvBackend, MemoryKvBackend};
use tracing::{info, warn, Instrument};

/// Upper bound on how long `run` waits for a step that has not completed.
const STEP_IDLE_LIMIT: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "lesson")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive lesson runtime", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Runtime configuration file (TOML)
    #[arg(long, global = true, env = "LESSON_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a lesson file for structural problems
    Validate {
        /// Path to the lesson (JSON)
        lesson: PathBuf,
    },

    /// List the builtin activity templates
    Templates {
        /// Only show templates of this category
        #[arg(short, long)]
        category: Option<Category>,
    },

    /// Play a lesson headlessly with scripted learner responses
    Run {
        /// Path to the lesson (JSON)
        lesson: PathBuf,

        /// Responses file: activity id -> selectors to click, in order
        #[arg(short, long)]
        responses: PathBuf,

        /// Persist activity and lesson data to this file instead of memory
        #[arg(long)]
        store: Option<PathBuf>,

        /// Write the lesson summary as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Validate { lesson } => cmd_validate(&config, &lesson),
        Commands::Templates { category } => cmd_templates(&config, category),
        Commands::Run {
            lesson,
            responses,
            store,
            output,
        } => {
            let summary = cmd_run(&config, &lesson, &responses, store.as_deref()).await?;
            print_summary(&summary);
            if let Some(path) = output {
                let body = serde_json::to_string_pretty(&summary)?;
                std::fs::write(&path, body)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Summary written to {}", path.display());
            }
            METRICS.flush();
            Ok(())
        }
    }
}

fn read_lesson(path: &Path) -> Result<LessonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read lesson {}", path.display()))?;
    Ok(LessonConfig::from_json_str(&raw)?)
}

/// Registry holding only the builtin templates.
fn builtin_registry(config: &RuntimeConfig) -> Result<TemplateRegistry> {
    let mut registry = TemplateRegistry::new(
        config.registry.clone(),
        Document::new(),
        builtin::catalog(),
        Arc::new(StaticFetcher::new()),
    );
    builtin::register_builtins(&mut registry)?;
    Ok(registry)
}

/// Check a lesson file. Templates the runtime does not ship are reported as
/// warnings since they may be registered at run time.
fn cmd_validate(config: &RuntimeConfig, path: &Path) -> Result<()> {
    let lesson = read_lesson(path)?;
    let _span = LessonSpan::enter(&lesson.lesson_id);
    let problems = validate_all(&lesson, config.orchestrator.strict_template_ids);

    let registry = builtin_registry(config)?;
    for step in &lesson.flow {
        if !step.template.is_empty() && !registry.contains(&step.template) {
            println!(
                "warning: {}: template {} is not a builtin",
                step.activity_id, step.template
            );
        }
    }

    if problems.is_empty() {
        println!(
            "{} ({}): {} step(s), ok",
            lesson.lesson_id,
            lesson.title,
            lesson.flow.len()
        );
        return Ok(());
    }
    for problem in &problems {
        println!("error: {problem}");
    }
    bail!("{} problem(s) in {}", problems.len(), path.display())
}

fn cmd_templates(config: &RuntimeConfig, category: Option<Category>) -> Result<()> {
    let registry = builtin_registry(config)?;
    let templates = registry.list(category);
    if templates.is_empty() {
        println!("No templates found");
        return Ok(());
    }
    for info in templates {
        let manifest = &info.manifest;
        println!(
            "{:<24} {:<12} {}",
            manifest.id,
            manifest.category,
            manifest.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Scripted learner input: for each activity id, the selectors to click in
/// order. Every element matching a selector is clicked.
type Responses = BTreeMap<String, Vec<String>>;

fn read_responses(path: &Path) -> Result<Responses> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read responses {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid responses file {}", path.display()))
}

/// Play `lesson` to the end. A step the responses do not complete is left
/// unfinished and the learner moves on to the next one.
async fn cmd_run(
    config: &RuntimeConfig,
    lesson: &Path,
    responses: &Path,
    store: Option<&Path>,
) -> Result<LessonSummary> {
    let lesson = read_lesson(lesson)?;
    let responses = read_responses(responses)?;
    let span = lesson_span(&lesson.lesson_id);
    play(config, lesson, responses, store).instrument(span).await
}

async fn play(
    config: &RuntimeConfig,
    lesson: LessonConfig,
    responses: Responses,
    store: Option<&Path>,
) -> Result<LessonSummary> {
    let backend: Arc<dyn KvBackend> = match store {
        Some(path) => Arc::new(FileKvBackend::open(path).await?),
        None => Arc::new(MemoryKvBackend::new()),
    };
    let fetcher = HttpBundleFetcher::new(Duration::from_millis(config.sandbox.preload_timeout_ms))?;

    let document = Document::new();
    let root = document.create_element("main");
    document.body().append_child(&root);
    let mut orchestrator = build_orchestrator(
        config,
        RuntimeParts {
            root: root.clone(),
            bus: EventBus::new(),
            store: backend,
            fetcher: Arc::new(fetcher),
            probe: Arc::new(ProcStatmProbe),
            script_host: None,
        },
    )?;

    let steps = lesson.flow.len();
    orchestrator.load_lesson(lesson).await?;

    // Each step is visited at most once going forward.
    for _ in 0..steps {
        if orchestrator.status() != LessonStatus::Active {
            break;
        }
        let Some(activity_id) = orchestrator.current_step().map(|s| s.activity_id.clone()) else {
            break;
        };
        for selector in responses.get(&activity_id).into_iter().flatten() {
            let targets = root.query_selector_all(selector);
            if targets.is_empty() {
                warn!(activity_id = %activity_id, selector = %selector, "nothing to click");
            }
            for target in targets {
                target.click();
            }
            orchestrator.process_events().await?;
        }
        orchestrator.run_until_settled().await?;
        while orchestrator.wait_and_process(STEP_IDLE_LIMIT).await? {}

        let still_here = orchestrator.status() == LessonStatus::Active
            && orchestrator.current_step().map(|s| s.activity_id.as_str())
                == Some(activity_id.as_str());
        if still_here {
            info!(activity_id = %activity_id, "step left unfinished");
            orchestrator.next().await?;
            orchestrator.run_until_settled().await?;
        }
    }

    let status = orchestrator.status();
    let summary = orchestrator.lesson_summary();
    orchestrator.shutdown().await;
    match (status, summary) {
        (LessonStatus::Completed, Some(summary)) => Ok(summary),
        (status, _) => {
            if let Some(log) = orchestrator.last_recovery() {
                warn!(
                    activity_id = %log.activity_id,
                    attempts = log.decisions.len(),
                    "activity recovery failed"
                );
            }
            bail!("lesson ended in state {status}")
        }
    }
}

fn print_summary(summary: &LessonSummary) {
    println!("Lesson:   {} ({})", summary.title, summary.lesson_id);
    println!("Score:    {:.1}%", summary.total_score * 100.0);
    println!("Passed:   {}", if summary.passed { "yes" } else { "no" });
    println!("Duration: {} ms", summary.duration_ms);
    println!();
    for activity in &summary.activities {
        match &activity.result {
            Some(result) => println!(
                "  {:<16} {:<20} {:>5.1}%",
                activity.activity_id,
                activity.template,
                result.score * 100.0
            ),
            None => println!(
                "  {:<16} {:<20} {:>6}",
                activity.activity_id, activity.template, "-"
            ),
        }
    }
}
