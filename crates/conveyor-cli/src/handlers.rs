//! Command handlers.

use crate::commands::EventKind;
use crate::config::{CliConfig, OutputFormat};
use crate::output;
use console::style;
use conveyor_core::pipeline::{PipelineDefinition, TriggerType};
use conveyor_runner::{RunnerConfig, ShellRunner};
use conveyor_scheduler::{
    DagBuilder, MatrixExpander, RunDisposition, Scheduler, SchedulerConfig, TracingEventBus,
    TriggerEvent,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type HandlerResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

const STARTER_PIPELINE: &str = r#"name: ci

triggers:
  - type: push
    branches: ["main", "*.*.x"]
  - type: pull_request

max_parallel: 4

jobs:
  - id: lint
    steps:
      - name: Lint
        run: echo "Linting..."

  - id: test
    needs: [lint]
    matrix:
      axes:
        version: ["stable", "beta"]
    steps:
      - name: Test
        run: echo "Testing on ${{ matrix.version }}"
"#;

/// Standard pipeline locations, relative to the working directory.
const PIPELINE_CANDIDATES: [&str; 4] = [
    ".conveyor/pipeline.yaml",
    ".conveyor/pipeline.yml",
    "conveyor.yaml",
    "conveyor.yml",
];

/// Resolve the pipeline file: the given path, else the first standard
/// location under `root` that exists.
pub fn find_pipeline_file(path: Option<PathBuf>, root: &Path) -> HandlerResult<PathBuf> {
    if let Some(path) = path {
        return Ok(path);
    }

    PIPELINE_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            format!(
                "no pipeline file found (looked for {})",
                PIPELINE_CANDIDATES.join(", ")
            )
            .into()
        })
}

/// Write a starter pipeline.
pub fn init(path: &Path) -> HandlerResult {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, STARTER_PIPELINE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> HandlerResult {
    let definition = PipelineDefinition::load(path)?;
    DagBuilder::new().validate(&definition)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}", definition.jobs.len());

    let expander = MatrixExpander::new();
    for job in &definition.jobs {
        let instances = expander.expand(job).len();
        let mut line = format!("    - {} ({} steps", job.id, job.steps.len());
        if job.matrix.is_some() {
            line.push_str(&format!(", {} instances", instances));
        }
        line.push(')');
        if !job.needs.is_empty() {
            let needs: Vec<&str> = job.needs.iter().map(|n| n.as_str()).collect();
            line.push_str(&format!(" needs {}", needs.join(", ")));
        }
        println!("{}", line);
    }

    Ok(())
}

/// Print the resolved run graph for an event kind.
pub fn plan(path: &Path, event: EventKind) -> HandlerResult {
    let definition = PipelineDefinition::load(path)?;
    let graph = DagBuilder::new().build_for_event(&definition, trigger_type(event))?;
    print!("{}", output::render_plan(&graph));
    Ok(())
}

/// Print the JSON schema of the pipeline file format.
pub fn schema() -> HandlerResult {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Options of the `run` command.
pub struct RunOptions {
    pub file: PathBuf,
    pub event: EventKind,
    pub branch: Option<String>,
    pub action: Option<String>,
    pub target_branch: Option<String>,
    pub event_file: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub timeout_minutes: Option<u32>,
    pub skip_actions: bool,
    pub workspace: Option<PathBuf>,
}

/// Evaluate the event and run the pipeline on this machine.
pub async fn run_pipeline(config: &CliConfig, opts: RunOptions) -> HandlerResult<ExitCode> {
    let definition = PipelineDefinition::load(&opts.file)?;
    let event = trigger_event(&opts)?;

    let workspace = match opts.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let runner = ShellRunner::new(RunnerConfig {
        timeout_seconds: config.step_timeout_seconds,
        retry_count: config.retry_count,
        skip_actions: opts.skip_actions || config.skip_actions,
        ..Default::default()
    });
    let scheduler = Scheduler::new(
        Arc::new(runner),
        Arc::new(TracingEventBus::new()),
        SchedulerConfig {
            workspace,
            max_parallel: opts.max_parallel.or(config.max_parallel),
            timeout_minutes: opts.timeout_minutes,
        },
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl-C, cancelling run");
            signal_cancel.cancel();
        }
    });

    let disposition = scheduler.handle_trigger(&definition, &event, cancel).await;
    signal_task.abort();

    match disposition {
        RunDisposition::Rejected(reason) => {
            info!(%reason, "no run started");
            println!("{} No run started: {}", style("-").dim(), reason);
            Ok(ExitCode::SUCCESS)
        }
        RunDisposition::Completed(report) => {
            match config.output_format {
                OutputFormat::Table => print!("{}", output::render_report(&report)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
            }
            Ok(ExitCode::from(report.verdict.exit_code()))
        }
    }
}

fn trigger_type(kind: EventKind) -> TriggerType {
    match kind {
        EventKind::Push => TriggerType::Push,
        EventKind::PullRequest => TriggerType::PullRequest,
    }
}

/// Build the trigger event from `--event-file` or the event flags.
pub fn trigger_event(opts: &RunOptions) -> HandlerResult<TriggerEvent> {
    if let Some(path) = &opts.event_file {
        let content = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&content)?);
    }

    Ok(match opts.event {
        EventKind::Push => TriggerEvent::Push {
            branch: opts.branch.clone(),
        },
        EventKind::PullRequest => TriggerEvent::PullRequest {
            action: opts.action.clone(),
            target_branch: opts.target_branch.clone(),
        },
    })
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> HandlerResult {
    println!("Current configuration:");
    print!("{}", serde_yaml::to_string(config)?);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(event: EventKind) -> RunOptions {
        RunOptions {
            file: PathBuf::from("conveyor.yaml"),
            event,
            branch: None,
            action: None,
            target_branch: None,
            event_file: None,
            max_parallel: None,
            timeout_minutes: None,
            skip_actions: false,
            workspace: None,
        }
    }

    #[test]
    fn test_trigger_event_from_flags() {
        let mut opts = options(EventKind::Push);
        opts.branch = Some("1.2.x".to_string());
        assert_eq!(trigger_event(&opts).unwrap(), TriggerEvent::push("1.2.x"));

        let mut opts = options(EventKind::PullRequest);
        opts.action = Some("opened".to_string());
        assert_eq!(
            trigger_event(&opts).unwrap(),
            TriggerEvent::pull_request("opened")
        );
    }

    #[test]
    fn test_trigger_event_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"event": "push", "branch": "refs/heads/main"}"#).unwrap();

        let mut opts = options(EventKind::PullRequest);
        opts.event_file = Some(path);
        assert_eq!(
            trigger_event(&opts).unwrap(),
            TriggerEvent::push("refs/heads/main")
        );
    }

    #[test]
    fn test_find_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_pipeline_file(None, dir.path()).is_err());

        std::fs::write(dir.path().join("conveyor.yml"), STARTER_PIPELINE).unwrap();
        assert_eq!(
            find_pipeline_file(None, dir.path()).unwrap(),
            dir.path().join("conveyor.yml")
        );

        std::fs::create_dir(dir.path().join(".conveyor")).unwrap();
        std::fs::write(dir.path().join(".conveyor/pipeline.yaml"), STARTER_PIPELINE).unwrap();
        assert_eq!(
            find_pipeline_file(None, dir.path()).unwrap(),
            dir.path().join(".conveyor/pipeline.yaml")
        );

        let explicit = PathBuf::from("ci/other.yaml");
        assert_eq!(
            find_pipeline_file(Some(explicit.clone()), dir.path()).unwrap(),
            explicit
        );
    }

    #[test]
    fn test_starter_pipeline_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.yaml");

        init(&path).unwrap();
        validate(&path).unwrap();

        let definition = PipelineDefinition::load(&path).unwrap();
        let graph = DagBuilder::new()
            .build_for_event(&definition, TriggerType::Push)
            .unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_plan_and_validate_reject_zero_slot_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.yaml");
        std::fs::write(
            &path,
            r#"
name: zero
max_parallel: 0
jobs:
  - id: a
    steps: []
"#,
        )
        .unwrap();

        assert!(plan(&path, EventKind::Push).unwrap_err().to_string().contains("max_parallel"));
        assert!(validate(&path).unwrap_err().to_string().contains("max_parallel"));
    }

    #[test]
    fn test_validate_reports_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.yaml");
        std::fs::write(
            &path,
            r#"
name: broken
jobs:
  - id: a
    needs: [b]
    steps: []
  - id: b
    needs: [a]
    steps: []
"#,
        )
        .unwrap();

        let err = validate(&path).unwrap_err();
        assert!(err.to_string().contains("a -> b -> a"));
    }
}
