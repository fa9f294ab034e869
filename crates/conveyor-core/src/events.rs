//! Run lifecycle events published by the scheduler.

use crate::ids::{JobId, RunId};
use crate::pipeline::TriggerType;
use crate::run::{CancelReason, JobStatus, RunVerdict, StepOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted(RunStartedPayload),
    JobStatusChanged(JobStatusChangedPayload),
    StepStarted(StepStartedPayload),
    StepCompleted(StepCompletedPayload),
    RunCancelled(RunCancelledPayload),
    RunCompleted(RunCompletedPayload),
}

impl Event {
    /// Dotted subject used for routing and log correlation.
    pub fn subject(&self) -> String {
        match self {
            Event::RunStarted(p) => format!("run.{}.started", p.run_id),
            Event::JobStatusChanged(p) => format!("run.{}.job.{}.{}", p.run_id, p.job_id, p.to),
            Event::StepStarted(p) => format!("run.{}.job.{}.step.started", p.run_id, p.job_id),
            Event::StepCompleted(p) => {
                format!("run.{}.job.{}.step.completed", p.run_id, p.job_id)
            }
            Event::RunCancelled(p) => format!("run.{}.cancelled", p.run_id),
            Event::RunCompleted(p) => format!("run.{}.completed", p.run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::JobStatusChanged(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::RunCancelled(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub trigger: TriggerType,
    pub job_count: usize,
    pub max_parallel: Option<usize>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusChangedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub step_name: String,
    pub step_index: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job_id: JobId,
    pub step_name: String,
    pub step_index: usize,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub reason: CancelReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub verdict: RunVerdict,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}
