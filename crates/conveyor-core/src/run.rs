//! Run and job-instance types.

use crate::error::{Error, Result};
use crate::ids::{JobId, TemplateId};
use crate::pipeline::StepDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lifecycle of a single job instance.
///
/// `Pending -> Ready -> Running -> {Succeeded | Failed}`, plus
/// `Pending -> Skipped` and `Ready -> Skipped`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Resolved matrix coordinate: axis name to rendered value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixCoordinate(BTreeMap<String, String>);

impl MatrixCoordinate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0.get(axis).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MatrixCoordinate {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for MatrixCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Outcome reported by a step runner for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure { reason: String },
}

impl StepOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        StepOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }
}

/// Record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// One concrete, schedulable unit after matrix expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobId,
    pub template_id: TemplateId,
    pub name: String,
    pub coordinate: MatrixCoordinate,
    /// Concrete dependency ids, filled in by the graph builder.
    pub needs: Vec<JobId>,
    pub steps: Vec<StepDefinition>,
    pub variables: HashMap<String, String>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_records: Vec<StepRecord>,
    /// Why the job failed or was skipped.
    pub reason: Option<String>,
}

impl JobInstance {
    /// Build the instance id from its template id and coordinate.
    pub fn instance_id(template_id: &TemplateId, coordinate: &MatrixCoordinate) -> JobId {
        if coordinate.is_empty() {
            JobId::new(template_id.as_str())
        } else {
            JobId::new(format!("{} ({})", template_id, coordinate))
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                job: self.id.to_string(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Success,
    Failure,
}

impl RunVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, RunVerdict::Success)
    }

    /// Process exit code for this verdict.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunVerdict::Success => 0,
            RunVerdict::Failure => 1,
        }
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunVerdict::Success => f.write_str("success"),
            RunVerdict::Failure => f.write_str("failure"),
        }
    }
}

/// Why a run stopped before every job reached a natural end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    Timeout { minutes: u32 },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => f.write_str("cancelled by request"),
            CancelReason::Timeout { minutes } => write!(f, "timed out after {} minutes", minutes),
        }
    }
}
