//! Run execution.
//!
//! A single coordinator owns the run graph and applies every status change.
//! Job tasks only run steps and hand back a [`JobResult`]; the coordinator
//! then settles the job and its dependents in one go before publishing.

use crate::dag::RunGraph;
use crate::queue::{QueueManager, QueuedJob};
use chrono::{DateTime, Utc};
use conveyor_core::events::{
    Event, JobStatusChangedPayload, RunCancelledPayload, RunCompletedPayload, RunStartedPayload,
    StepCompletedPayload, StepStartedPayload,
};
use conveyor_core::ids::RunId;
use conveyor_core::pipeline::{StepDefinition, TriggerType};
use conveyor_core::ports::{EventBus, StepContext, StepRunner};
use conveyor_core::run::{CancelReason, JobStatus, RunVerdict, StepOutcome, StepRecord};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Per-run settings handed to the executor.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub trigger: TriggerType,
    pub workspace: PathBuf,
    /// Pipeline-level variables; job variables are overlaid per instance.
    pub variables: HashMap<String, String>,
    /// Maximum concurrently running jobs. `None` means unlimited.
    pub max_parallel: Option<usize>,
    pub timeout_minutes: Option<u32>,
}

/// What a job task reports back to the coordinator.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: JobStatus,
    pub reason: Option<String>,
    pub step_records: Vec<StepRecord>,
}

impl JobResult {
    fn failed(reason: impl Into<String>, step_records: Vec<StepRecord>) -> Self {
        Self {
            status: JobStatus::Failed,
            reason: Some(reason.into()),
            step_records,
        }
    }
}

/// Final state of an executed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub graph: RunGraph,
    pub cancelled: Option<CancelReason>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Success iff the run was not cancelled and every instance succeeded.
    pub fn verdict(&self) -> RunVerdict {
        verdict_of(&self.graph, self.cancelled.as_ref())
    }

    pub fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

fn verdict_of(graph: &RunGraph, cancelled: Option<&CancelReason>) -> RunVerdict {
    if cancelled.is_none() && graph.instances().all(|j| j.status == JobStatus::Succeeded) {
        RunVerdict::Success
    } else {
        RunVerdict::Failure
    }
}

/// Drives one run graph to completion.
pub struct RunExecutor {
    runner: Arc<dyn StepRunner>,
    event_bus: Arc<dyn EventBus>,
}

impl RunExecutor {
    pub fn new(runner: Arc<dyn StepRunner>, event_bus: Arc<dyn EventBus>) -> Self {
        Self { runner, event_bus }
    }

    /// Execute every instance of `graph`, honoring dependencies, the slot
    /// limit, the run timeout and `cancel`.
    ///
    /// Always returns with every instance in a terminal status.
    #[instrument(
        name = "run_execute",
        skip(self, graph, ctx, cancel),
        fields(run_id = %ctx.run_id, pipeline = %ctx.pipeline_name)
    )]
    pub async fn execute(
        &self,
        graph: RunGraph,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let started_at = Utc::now();
        let ctx = Arc::new(ctx);
        let job_cancel = cancel.child_token();

        info!(jobs = graph.len(), max_parallel = ?ctx.max_parallel, "run_started");
        self.publish(Event::RunStarted(RunStartedPayload {
            run_id: ctx.run_id,
            pipeline_name: ctx.pipeline_name.clone(),
            trigger: ctx.trigger,
            job_count: graph.len(),
            max_parallel: ctx.max_parallel,
            started_at,
        }))
        .await;

        let mut state = RunState::new(ctx.run_id, graph, ctx.max_parallel);
        let mut running: JoinSet<(QueuedJob, JobResult)> = JoinSet::new();

        let deadline = ctx
            .timeout_minutes
            .map(|minutes| Instant::now() + Duration::from_secs(u64::from(minutes) * 60));
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        state.seed();

        loop {
            if state.cancelled.is_none() && cancel.is_cancelled() {
                state.cancel(CancelReason::UserRequested, &job_cancel);
            }

            let mut started = Vec::new();
            if state.cancelled.is_none() {
                while let Some(queued) = state.queue.dequeue() {
                    match state.start(&queued, &ctx) {
                        Some(job) => started.push((queued, job)),
                        None => state.queue.complete(&queued),
                    }
                }
            }

            // Status changes go out before the jobs they announce begin.
            self.flush(&mut state).await;

            for (queued, job) in started {
                let task = JobTask {
                    runner: self.runner.clone(),
                    event_bus: self.event_bus.clone(),
                    steps: job.steps,
                    ctx: job.ctx,
                    cancel: job_cancel.clone(),
                };
                running.spawn(async move {
                    // Inner task so that a panicking step runner fails only its job.
                    let result = match tokio::spawn(task.run()).await {
                        Ok(result) => result,
                        Err(e) => JobResult::failed(format!("job task panicked: {}", e), vec![]),
                    };
                    (queued, result)
                });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(joined) = running.join_next() => match joined {
                    Ok((queued, result)) => state.complete(&queued, result),
                    Err(e) => error!(error = %e, "job wrapper task failed"),
                },
                _ = cancel.cancelled(), if state.cancelled.is_none() => {
                    state.cancel(CancelReason::UserRequested, &job_cancel);
                }
                _ = &mut timeout, if state.cancelled.is_none() => {
                    let minutes = ctx.timeout_minutes.unwrap_or_default();
                    warn!(minutes, "run timed out");
                    state.cancel(CancelReason::Timeout { minutes }, &job_cancel);
                }
                else => break,
            }
        }

        state.settle_leftovers();
        self.flush(&mut state).await;

        let completed_at = Utc::now();
        let verdict = verdict_of(&state.graph, state.cancelled.as_ref());
        let outcome = RunOutcome {
            run_id: ctx.run_id,
            graph: state.graph,
            cancelled: state.cancelled,
            started_at,
            completed_at,
        };

        info!(%verdict, duration_ms = outcome.duration_ms(), "run_completed");
        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: ctx.run_id,
            verdict,
            duration_ms: outcome.duration_ms(),
            completed_at,
        }))
        .await;

        outcome
    }

    async fn flush(&self, state: &mut RunState) {
        for event in state.events.drain(..) {
            publish(self.event_bus.as_ref(), event).await;
        }
    }

    async fn publish(&self, event: Event) {
        publish(self.event_bus.as_ref(), event).await;
    }
}

/// Event delivery is best effort; a failing sink never stops a run.
async fn publish(bus: &dyn EventBus, event: Event) {
    let subject = event.subject();
    if let Err(e) = bus.publish(event).await {
        warn!(%subject, error = %e, "failed to publish event");
    }
}

/// Coordinator-owned run state. Only touched between awaits of the loop.
struct RunState {
    run_id: RunId,
    graph: RunGraph,
    /// Number of dependencies of each node that have not yet succeeded.
    unmet: HashMap<NodeIndex, usize>,
    queue: QueueManager,
    events: Vec<Event>,
    cancelled: Option<CancelReason>,
}

/// Snapshot handed to a job task when it starts.
struct StartedJob {
    steps: Vec<StepDefinition>,
    ctx: StepContext,
}

impl RunState {
    fn new(run_id: RunId, graph: RunGraph, max_parallel: Option<usize>) -> Self {
        let mut queue = QueueManager::new(max_parallel);
        let unmet = graph
            .indices()
            .map(|idx| (idx, graph.dependencies(idx).len()))
            .collect();
        for instance in graph.instances() {
            if let Some(limit) = graph.group_limit(&instance.template_id) {
                queue.set_concurrency_limit(instance.template_id.clone(), limit);
            }
        }

        Self {
            run_id,
            graph,
            unmet,
            queue,
            events: Vec::new(),
            cancelled: None,
        }
    }

    /// Mark every instance without dependencies ready, in insertion order.
    fn seed(&mut self) {
        let roots: Vec<NodeIndex> = self
            .graph
            .indices()
            .filter(|idx| self.unmet.get(idx).copied().unwrap_or(0) == 0)
            .collect();
        for idx in roots {
            self.make_ready(idx);
        }
    }

    fn make_ready(&mut self, idx: NodeIndex) {
        if !self.set_status(idx, JobStatus::Ready, None) {
            return;
        }
        let instance = self.graph.instance(idx);
        self.queue.enqueue(QueuedJob {
            node: idx,
            job_id: instance.id.clone(),
            queued_at: Utc::now(),
            concurrency_group: Some(instance.template_id.clone()),
        });
    }

    fn start(&mut self, queued: &QueuedJob, run: &RunContext) -> Option<StartedJob> {
        if !self.set_status(queued.node, JobStatus::Running, None) {
            return None;
        }
        let instance = self.graph.instance(queued.node);
        debug!(job = %instance.id, "dispatching job");

        let mut variables = run.variables.clone();
        variables.extend(instance.variables.clone());
        Some(StartedJob {
            steps: instance.steps.clone(),
            ctx: StepContext {
                run_id: self.run_id,
                job_id: instance.id.clone(),
                template_id: instance.template_id.clone(),
                coordinate: instance.coordinate.clone(),
                workspace: run.workspace.clone(),
                variables,
            },
        })
    }

    /// Apply a finished job and everything it implies for its dependents.
    fn complete(&mut self, queued: &QueuedJob, result: JobResult) {
        self.queue.complete(queued);
        let idx = queued.node;

        let instance = self.graph.instance_mut(idx);
        instance.step_records = result.step_records;
        let status = result.status;
        if !self.set_status(idx, status, result.reason) {
            return;
        }

        match status {
            JobStatus::Succeeded => {
                for dependent in self.graph.dependents(idx) {
                    let unmet = self.unmet.entry(dependent).or_insert(0);
                    *unmet = unmet.saturating_sub(1);
                    let now_ready = *unmet == 0
                        && self.graph.instance(dependent).status == JobStatus::Pending
                        && self.cancelled.is_none();
                    if now_ready {
                        self.make_ready(dependent);
                    }
                }
            }
            _ => self.skip_dependents(idx),
        }
    }

    /// Skip every job reachable from `failed` that has not finished.
    fn skip_dependents(&mut self, failed: NodeIndex) {
        let failed_id = self.graph.instance(failed).id.clone();
        let mut frontier: VecDeque<NodeIndex> = self.graph.dependents(failed).into();

        while let Some(idx) = frontier.pop_front() {
            if self.graph.instance(idx).is_terminal() {
                continue;
            }
            let reason = format!("dependency `{}` did not succeed", failed_id);
            if self.set_status(idx, JobStatus::Skipped, Some(reason)) {
                frontier.extend(self.graph.dependents(idx));
            }
        }
    }

    /// Stop dispatching, skip everything not yet running and signal running jobs.
    fn cancel(&mut self, reason: CancelReason, job_cancel: &CancellationToken) {
        warn!(run_id = %self.run_id, %reason, "cancelling run");
        job_cancel.cancel();
        self.events.push(Event::RunCancelled(RunCancelledPayload {
            run_id: self.run_id,
            reason: reason.clone(),
            at: Utc::now(),
        }));

        let message = format!("run cancelled: {}", reason);
        for queued in self.queue.drain() {
            self.set_status(queued.node, JobStatus::Skipped, Some(message.clone()));
        }
        let pending: Vec<NodeIndex> = self
            .graph
            .indices()
            .filter(|&idx| self.graph.instance(idx).status == JobStatus::Pending)
            .collect();
        for idx in pending {
            self.set_status(idx, JobStatus::Skipped, Some(message.clone()));
        }
        self.cancelled = Some(reason);
    }

    /// Anything still unsettled once no job is running can never finish.
    fn settle_leftovers(&mut self) {
        let leftovers: Vec<(NodeIndex, JobStatus)> = self
            .graph
            .indices()
            .map(|idx| (idx, self.graph.instance(idx).status))
            .filter(|(_, status)| !status.is_terminal())
            .collect();
        for (idx, status) in leftovers {
            error!(job = %self.graph.instance(idx).id, %status, "job left unsettled");
            let next = match status {
                JobStatus::Running => JobStatus::Failed,
                _ => JobStatus::Skipped,
            };
            self.set_status(idx, next, Some("job could not be scheduled".to_string()));
        }
    }

    /// Transition an instance and record the event. Returns false if the
    /// lifecycle forbids the change.
    fn set_status(&mut self, idx: NodeIndex, next: JobStatus, reason: Option<String>) -> bool {
        let instance = self.graph.instance_mut(idx);
        let from = instance.status;
        if let Err(e) = instance.transition(next) {
            error!(error = %e, "rejected status change");
            return false;
        }
        if reason.is_some() {
            instance.reason = reason.clone();
        }

        match next {
            JobStatus::Succeeded => info!(job = %instance.id, "job_succeeded"),
            JobStatus::Failed => warn!(job = %instance.id, reason = ?reason, "job_failed"),
            JobStatus::Skipped => info!(job = %instance.id, reason = ?reason, "job_skipped"),
            _ => debug!(job = %instance.id, %from, to = %next, "job status changed"),
        }

        self.events
            .push(Event::JobStatusChanged(JobStatusChangedPayload {
                run_id: self.run_id,
                job_id: instance.id.clone(),
                from,
                to: next,
                reason,
                at: Utc::now(),
            }));
        true
    }
}

/// Runs the steps of one job in order.
struct JobTask {
    runner: Arc<dyn StepRunner>,
    event_bus: Arc<dyn EventBus>,
    steps: Vec<StepDefinition>,
    ctx: StepContext,
    cancel: CancellationToken,
}

impl JobTask {
    async fn run(self) -> JobResult {
        let mut records = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return JobResult::failed("cancelled", records);
            }

            publish(
                self.event_bus.as_ref(),
                Event::StepStarted(StepStartedPayload {
                    run_id: self.ctx.run_id,
                    job_id: self.ctx.job_id.clone(),
                    step_name: step.name.clone(),
                    step_index: index,
                    at: Utc::now(),
                }),
            )
            .await;

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return JobResult::failed("cancelled", records);
                }
                result = self.runner.run_step(step, &self.ctx) => match result {
                    Ok(outcome) => outcome,
                    Err(e) => StepOutcome::failure(e.to_string()),
                },
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            publish(
                self.event_bus.as_ref(),
                Event::StepCompleted(StepCompletedPayload {
                    run_id: self.ctx.run_id,
                    job_id: self.ctx.job_id.clone(),
                    step_name: step.name.clone(),
                    step_index: index,
                    outcome: outcome.clone(),
                    duration_ms,
                }),
            )
            .await;

            records.push(StepRecord {
                name: step.name.clone(),
                outcome: outcome.clone(),
                duration_ms,
            });

            if let StepOutcome::Failure { reason } = outcome {
                return JobResult::failed(format!("step `{}` failed: {}", step.name, reason), records);
            }
        }

        JobResult {
            status: JobStatus::Succeeded,
            reason: None,
            step_records: records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastEventBus;
    use crate::dag::DagBuilder;
    use async_trait::async_trait;
    use conveyor_core::Result;
    use conveyor_core::ids::TemplateId;
    use conveyor_core::pipeline::{CorrelationPolicy, JobTemplate, PipelineDefinition};
    use pretty_assertions::assert_eq;

    /// Fails any step whose job id starts with `fail`.
    struct PrefixRunner;

    #[async_trait]
    impl StepRunner for PrefixRunner {
        async fn run_step(&self, _step: &StepDefinition, ctx: &StepContext) -> Result<StepOutcome> {
            if ctx.job_id.as_str().starts_with("fail") {
                Ok(StepOutcome::failure("exit code 1"))
            } else {
                Ok(StepOutcome::Success)
            }
        }
    }

    struct PanicRunner;

    #[async_trait]
    impl StepRunner for PanicRunner {
        async fn run_step(&self, _step: &StepDefinition, _ctx: &StepContext) -> Result<StepOutcome> {
            panic!("runner bug");
        }
    }

    fn job(id: &str, needs: &[&str]) -> JobTemplate {
        JobTemplate {
            id: TemplateId::new(id),
            name: None,
            on: None,
            needs: needs.iter().map(|s| TemplateId::new(*s)).collect(),
            matrix: None,
            correlation: None,
            max_parallel: None,
            variables: Default::default(),
            steps: vec![StepDefinition {
                name: "step".to_string(),
                run: Some("true".to_string()),
                uses: None,
                with: Default::default(),
                shell: "bash".to_string(),
                working_directory: None,
                variables: Default::default(),
                timeout_minutes: 30,
            }],
        }
    }

    fn graph(jobs: Vec<JobTemplate>) -> RunGraph {
        let pipeline = PipelineDefinition {
            version: "1".to_string(),
            name: "test".to_string(),
            description: None,
            triggers: vec![],
            variables: Default::default(),
            jobs,
            correlation: CorrelationPolicy::Broadcast,
            max_parallel: None,
            timeout_minutes: None,
        };
        DagBuilder::new()
            .build_for_event(&pipeline, TriggerType::Push)
            .unwrap()
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new(),
            pipeline_name: "test".to_string(),
            trigger: TriggerType::Push,
            workspace: PathBuf::from("."),
            variables: Default::default(),
            max_parallel: None,
            timeout_minutes: None,
        }
    }

    fn status(outcome: &RunOutcome, id: &str) -> JobStatus {
        outcome
            .graph
            .get(&conveyor_core::ids::JobId::new(id))
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_transitively() {
        let executor = RunExecutor::new(Arc::new(PrefixRunner), Arc::new(BroadcastEventBus::default()));
        let graph = graph(vec![
            job("fail_lint", &[]),
            job("unit", &["fail_lint"]),
            job("deploy", &["unit"]),
            job("docs", &[]),
        ]);

        let outcome = executor.execute(graph, ctx(), CancellationToken::new()).await;

        assert_eq!(status(&outcome, "fail_lint"), JobStatus::Failed);
        assert_eq!(status(&outcome, "unit"), JobStatus::Skipped);
        assert_eq!(status(&outcome, "deploy"), JobStatus::Skipped);
        assert_eq!(status(&outcome, "docs"), JobStatus::Succeeded);
        assert_eq!(outcome.verdict(), RunVerdict::Failure);
        assert!(outcome.graph.instances().all(|j| j.is_terminal()));
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let bus = BroadcastEventBus::new(64);
        let mut rx = bus.subscribe();
        let executor = RunExecutor::new(Arc::new(PrefixRunner), Arc::new(bus));

        let outcome = executor
            .execute(graph(vec![job("build", &[])]), ctx(), CancellationToken::new())
            .await;
        assert_eq!(outcome.verdict(), RunVerdict::Success);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                Event::RunStarted(_) => "run_started".to_string(),
                Event::JobStatusChanged(p) => p.to.to_string(),
                Event::StepStarted(_) => "step_started".to_string(),
                Event::StepCompleted(_) => "step_completed".to_string(),
                Event::RunCancelled(_) => "run_cancelled".to_string(),
                Event::RunCompleted(_) => "run_completed".to_string(),
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "ready",
                "running",
                "step_started",
                "step_completed",
                "succeeded",
                "run_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_runner_fails_only_its_job() {
        let executor = RunExecutor::new(Arc::new(PanicRunner), Arc::new(BroadcastEventBus::default()));
        let outcome = executor
            .execute(
                graph(vec![job("a", &[]), job("b", &["a"])]),
                ctx(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(status(&outcome, "a"), JobStatus::Failed);
        assert_eq!(status(&outcome, "b"), JobStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let executor = RunExecutor::new(Arc::new(PrefixRunner), Arc::new(BroadcastEventBus::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor
            .execute(graph(vec![job("a", &[]), job("b", &["a"])]), ctx(), cancel)
            .await;

        assert_eq!(outcome.cancelled, Some(CancelReason::UserRequested));
        assert_eq!(status(&outcome, "a"), JobStatus::Skipped);
        assert_eq!(status(&outcome, "b"), JobStatus::Skipped);
        assert_eq!(outcome.verdict(), RunVerdict::Failure);
    }
}
