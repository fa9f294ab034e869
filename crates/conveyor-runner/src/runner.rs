//! Runner configuration and output types.

use conveyor_core::ids::JobId;
use std::time::Duration;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job_id: JobId,
    pub step_name: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on any single step, on top of the step's own timeout.
    pub timeout_seconds: Option<u64>,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Treat `uses:` steps as successful no-ops instead of failures.
    pub skip_actions: bool,
    /// Pass the parent process environment through to steps.
    pub inherit_env: bool,
}

impl RunnerConfig {
    /// Effective timeout for a step declaring `step_minutes`.
    pub fn step_timeout(&self, step_minutes: u32) -> Duration {
        let declared = Duration::from_secs(u64::from(step_minutes) * 60);
        match self.timeout_seconds {
            Some(cap) => declared.min(Duration::from_secs(cap)),
            None => declared,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Some(3600), // 1 hour default
            retry_count: 0,
            retry_delay_ms: 1000,
            skip_actions: false,
            inherit_env: true,
        }
    }
}
