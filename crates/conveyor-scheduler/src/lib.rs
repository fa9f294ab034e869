//! Pipeline scheduling and orchestration for Conveyor.
//!
//! Turns a pipeline definition and a trigger event into a graph of job
//! instances and drives that graph to a verdict.

pub mod bus;
pub mod dag;
pub mod executor;
pub mod matrix;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod triggers;

pub use bus::{BroadcastEventBus, FanoutEventBus, TracingEventBus};
pub use dag::{DagBuilder, GraphError, RunGraph};
pub use executor::{RunContext, RunExecutor, RunOutcome};
pub use matrix::MatrixExpander;
pub use report::{JobReport, RunReport, RunReporter};
pub use scheduler::{RunDisposition, Scheduler, SchedulerConfig};
pub use triggers::{RejectReason, RunDecision, TriggerEvaluator, TriggerEvent};
