//! Error types for Conveyor.

use crate::run::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline graph error: {0}")]
    Graph(String),

    // Run errors
    #[error("Illegal status transition for job {job}: {from} -> {to}")]
    IllegalTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    // Step errors
    #[error("Step timeout after {minutes} minutes")]
    StepTimeout { minutes: u32 },

    #[error("Step execution error: {0}")]
    StepExecution(String),

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}
