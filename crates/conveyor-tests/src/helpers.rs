//! Fake collaborators and a harness for driving runs.

use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::events::Event;
use conveyor_core::ids::JobId;
use conveyor_core::pipeline::{PipelineDefinition, StepDefinition, TriggerType};
use conveyor_core::ports::{EventBus, StepContext, StepRunner};
use conveyor_core::run::{JobStatus, StepOutcome};
use conveyor_scheduler::{RunDisposition, RunReport, Scheduler, SchedulerConfig, TriggerEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Succeeds every step.
pub struct AlwaysSucceed;

#[async_trait]
impl StepRunner for AlwaysSucceed {
    async fn run_step(&self, _step: &StepDefinition, _ctx: &StepContext) -> Result<StepOutcome> {
        Ok(StepOutcome::Success)
    }
}

/// Fails every step of the named jobs, matched by template id or job id.
pub struct FailOn {
    jobs: HashSet<String>,
}

impl FailOn {
    pub fn jobs<'a>(jobs: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            jobs: jobs.into_iter().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
impl StepRunner for FailOn {
    async fn run_step(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepOutcome> {
        if self.jobs.contains(ctx.template_id.as_str()) || self.jobs.contains(ctx.job_id.as_str()) {
            return Ok(StepOutcome::failure(format!("{} exited with 1", step.name)));
        }
        Ok(StepOutcome::Success)
    }
}

/// Sleeps for a fixed time per step, tracking how many steps overlap.
#[derive(Default)]
pub struct Delayed {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl Delayed {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Highest number of steps ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepRunner for Delayed {
    async fn run_step(&self, _step: &StepDefinition, _ctx: &StepContext) -> Result<StepOutcome> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome::Success)
    }
}

/// Never finishes a step; signals each time one starts.
#[derive(Default)]
pub struct Hang {
    started: AtomicUsize,
    notify: Notify,
}

impl Hang {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until at least `n` steps have started.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.started.load(Ordering::SeqCst) >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl StepRunner for Hang {
    async fn run_step(&self, _step: &StepDefinition, _ctx: &StepContext) -> Result<StepOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        std::future::pending::<()>().await;
        Ok(StepOutcome::Success)
    }
}

/// Stores every published event.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Job status changes in publication order.
    pub async fn transitions(&self) -> Vec<(JobId, JobStatus)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::JobStatusChanged(p) => Some((p.job_id.clone(), p.to)),
                _ => None,
            })
            .collect()
    }

    /// Position of the first transition of `job` to `status`.
    pub async fn position(&self, job: &str, status: JobStatus) -> Option<usize> {
        self.transitions()
            .await
            .iter()
            .position(|(id, to)| id.as_str() == job && *to == status)
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Scheduler wired to a fake runner and a recording bus.
pub struct Harness<R> {
    pub runner: Arc<R>,
    pub events: Arc<RecordingEventBus>,
    pub scheduler: Scheduler,
}

impl<R: StepRunner + 'static> Harness<R> {
    pub fn new(runner: R) -> Self {
        Self::with_config(runner, SchedulerConfig::default())
    }

    pub fn with_config(runner: R, config: SchedulerConfig) -> Self {
        let runner = Arc::new(runner);
        let events = Arc::new(RecordingEventBus::new());
        let scheduler = Scheduler::new(runner.clone(), events.clone(), config);
        Self {
            runner,
            events,
            scheduler,
        }
    }

    /// Run `pipeline` for `trigger` to completion.
    pub async fn run(&self, pipeline: &PipelineDefinition, trigger: TriggerType) -> RunReport {
        self.scheduler
            .start_run(pipeline, trigger, CancellationToken::new())
            .await
    }

    /// Feed `event` through trigger evaluation and run if accepted.
    pub async fn trigger(&self, pipeline: &PipelineDefinition, event: TriggerEvent) -> RunDisposition {
        self.scheduler
            .handle_trigger(pipeline, &event, CancellationToken::new())
            .await
    }
}
