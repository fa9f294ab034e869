//! Run summaries.

use crate::executor::RunOutcome;
use chrono::{DateTime, Utc};
use conveyor_core::ids::{JobId, RunId, TemplateId};
use conveyor_core::pipeline::TriggerType;
use conveyor_core::run::{CancelReason, JobStatus, MatrixCoordinate, RunVerdict, StepRecord};
use serde::{Deserialize, Serialize};

/// Final summary of a run: verdict plus the status of every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub trigger: Option<TriggerType>,
    pub verdict: RunVerdict,
    pub cancelled: Option<CancelReason>,
    /// Structural error that kept the run from starting.
    pub error: Option<String>,
    pub jobs: Vec<JobReport>,
    /// Templates that produced no instances for this run.
    pub not_evaluated: Vec<TemplateId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub template_id: TemplateId,
    pub name: String,
    pub coordinate: MatrixCoordinate,
    pub status: JobStatus,
    pub duration_ms: Option<u64>,
    pub reason: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id.as_str() == id)
    }

    /// Number of jobs that ended in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Builds [`RunReport`]s.
pub struct RunReporter;

impl RunReporter {
    /// Summarize an executed run. Jobs are listed in graph insertion order.
    pub fn summarize(pipeline_name: &str, trigger: TriggerType, outcome: &RunOutcome) -> RunReport {
        let jobs = outcome
            .graph
            .instances()
            .map(|instance| JobReport {
                id: instance.id.clone(),
                template_id: instance.template_id.clone(),
                name: instance.name.clone(),
                coordinate: instance.coordinate.clone(),
                status: instance.status,
                duration_ms: instance.duration_ms(),
                reason: instance.reason.clone(),
                steps: instance.step_records.clone(),
            })
            .collect();

        RunReport {
            run_id: outcome.run_id,
            pipeline_name: pipeline_name.to_string(),
            trigger: Some(trigger),
            verdict: outcome.verdict(),
            cancelled: outcome.cancelled.clone(),
            error: None,
            jobs,
            not_evaluated: outcome.graph.not_evaluated().to_vec(),
            started_at: outcome.started_at,
            completed_at: outcome.completed_at,
            duration_ms: outcome.duration_ms(),
        }
    }

    /// Report for a run that could not start because the pipeline is invalid.
    pub fn structural_failure(
        run_id: RunId,
        pipeline_name: &str,
        trigger: Option<TriggerType>,
        templates: Vec<TemplateId>,
        error: &conveyor_core::Error,
    ) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id,
            pipeline_name: pipeline_name.to_string(),
            trigger,
            verdict: RunVerdict::Failure,
            cancelled: None,
            error: Some(error.to_string()),
            jobs: vec![],
            not_evaluated: templates,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }
}
