//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler and the
//! collaborators it drives: step runners and event sinks.

use crate::Result;
use crate::events::Event;
use crate::ids::{JobId, RunId, TemplateId};
use crate::pipeline::StepDefinition;
use crate::run::{MatrixCoordinate, StepOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything a step runner may need to know about where a step runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub job_id: JobId,
    pub template_id: TemplateId,
    pub coordinate: MatrixCoordinate,
    pub workspace: PathBuf,
    /// Pipeline variables overlaid with job variables.
    pub variables: HashMap<String, String>,
}

/// Executes one step. The scheduler treats this as opaque, possibly slow
/// and possibly side-effecting.
///
/// A step whose future is dropped must stop as soon as it can; this is how
/// running jobs are asked to stop on cancellation.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run a single step. `Err` is treated the same as a failure outcome.
    async fn run_step(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Sink for run lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;
}
