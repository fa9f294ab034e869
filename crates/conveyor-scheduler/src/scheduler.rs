//! Main scheduler orchestration.

use crate::dag::DagBuilder;
use crate::executor::{RunContext, RunExecutor};
use crate::report::{RunReport, RunReporter};
use crate::triggers::{RejectReason, RunDecision, TriggerEvaluator, TriggerEvent};

use conveyor_core::ids::RunId;
use conveyor_core::pipeline::{PipelineDefinition, TriggerType};
use conveyor_core::ports::{EventBus, StepRunner};
use conveyor_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Settings that apply to every run started by a scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Directory steps run in.
    pub workspace: PathBuf,
    /// Overrides the pipeline's `max_parallel` when set.
    pub max_parallel: Option<usize>,
    /// Overrides the pipeline's `timeout_minutes` when set.
    pub timeout_minutes: Option<u32>,
}

/// What happened to a trigger event.
#[derive(Debug, Clone)]
pub enum RunDisposition {
    /// No run was started.
    Rejected(RejectReason),
    Completed(Box<RunReport>),
}

/// The main scheduler service.
pub struct Scheduler {
    executor: RunExecutor,
    dag_builder: DagBuilder,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn StepRunner>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor: RunExecutor::new(runner, event_bus),
            dag_builder: DagBuilder::new(),
            config,
        }
    }

    /// Handle a trigger event and run the pipeline if it matches.
    pub async fn handle_trigger(
        &self,
        pipeline: &PipelineDefinition,
        event: &TriggerEvent,
        cancel: CancellationToken,
    ) -> RunDisposition {
        match TriggerEvaluator::for_pipeline(pipeline).evaluate(event) {
            RunDecision::Rejected { reason } => {
                info!(pipeline = %pipeline.name, %reason, "trigger rejected");
                RunDisposition::Rejected(reason)
            }
            RunDecision::Accepted { trigger } => {
                let report = self.start_run(pipeline, trigger, cancel).await;
                RunDisposition::Completed(Box::new(report))
            }
        }
    }

    /// Start a pipeline run and drive it to completion.
    ///
    /// A structurally invalid pipeline yields a failed report with no jobs.
    pub async fn start_run(
        &self,
        pipeline: &PipelineDefinition,
        trigger: TriggerType,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_id = RunId::new();

        let prepared = self
            .max_parallel(pipeline)
            .and_then(|max_parallel| {
                let graph = self.dag_builder.build_for_event(pipeline, trigger)?;
                Ok((max_parallel, graph))
            });
        let (max_parallel, graph) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(%run_id, pipeline = %pipeline.name, error = %e, "pipeline rejected");
                return RunReporter::structural_failure(
                    run_id,
                    &pipeline.name,
                    Some(trigger),
                    pipeline.jobs.iter().map(|j| j.id.clone()).collect(),
                    &e,
                );
            }
        };

        let ctx = RunContext {
            run_id,
            pipeline_name: pipeline.name.clone(),
            trigger,
            workspace: self.config.workspace.clone(),
            variables: pipeline.variables.clone(),
            max_parallel,
            timeout_minutes: self.config.timeout_minutes.or(pipeline.timeout_minutes),
        };

        let outcome = self.executor.execute(graph, ctx, cancel).await;
        RunReporter::summarize(&pipeline.name, trigger, &outcome)
    }

    fn max_parallel(&self, pipeline: &PipelineDefinition) -> Result<Option<usize>> {
        let max_parallel = self
            .config
            .max_parallel
            .or(pipeline.max_parallel.map(|n| n as usize));
        if max_parallel == Some(0) {
            return Err(Error::InvalidPipeline(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        Ok(max_parallel)
    }
}
