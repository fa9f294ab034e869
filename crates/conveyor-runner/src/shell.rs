//! Shell-based step execution on the host.

use crate::interpolation::InterpolationContext;
use crate::runner::{OutputLine, OutputStream, RunnerConfig};
use async_trait::async_trait;
use conveyor_core::ids::JobId;
use conveyor_core::pipeline::StepDefinition;
use conveyor_core::ports::{StepContext, StepRunner};
use conveyor_core::run::StepOutcome;
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

/// Shell runner for executing commands on the host.
///
/// Dropping a step future kills its process.
pub struct ShellRunner {
    config: RunnerConfig,
    output: Option<mpsc::Sender<OutputLine>>,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            output: None,
        }
    }

    /// Also forward every output line to `tx`.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output = Some(tx);
        self
    }

    async fn execute_command(
        &self,
        command: &str,
        step: &StepDefinition,
        ctx: &StepContext,
        env_vars: &HashMap<String, String>,
    ) -> Result<StepOutcome> {
        let workspace = match &step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };

        info!(
            job = %ctx.job_id,
            step = %step.name,
            command = %command,
            workspace = %workspace.display(),
            "Executing shell command"
        );

        let mut cmd = Command::new(&step.shell);
        if !self.config.inherit_env {
            cmd.env_clear();
        }
        let mut child = cmd
            .arg("-c")
            .arg(command)
            .current_dir(&workspace)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StepExecution(format!("Failed to spawn `{}`: {}", step.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::StepExecution("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::StepExecution("stderr not captured".to_string()))?;

        let stdout_handle = tokio::spawn(stream_lines(
            stdout,
            OutputStream::Stdout,
            ctx.job_id.clone(),
            step.name.clone(),
            self.output.clone(),
        ));
        let stderr_handle = tokio::spawn(stream_lines(
            stderr,
            OutputStream::Stderr,
            ctx.job_id.clone(),
            step.name.clone(),
            self.output.clone(),
        ));

        // Wait for process with timeout
        let limit = self.config.step_timeout(step.timeout_minutes);
        let wait_result = match timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job = %ctx.job_id, step = %step.name, ?limit, "Command timed out, killing process");
                let _ = child.kill().await;
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(Error::StepTimeout {
                    minutes: step.timeout_minutes,
                });
            }
        };

        // Wait for output streaming to complete
        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let status = wait_result
            .map_err(|e| Error::StepExecution(format!("Failed to wait for process: {}", e)))?;

        match status.code() {
            Some(0) => {
                debug!(job = %ctx.job_id, step = %step.name, "Command completed");
                Ok(StepOutcome::Success)
            }
            Some(code) => Ok(StepOutcome::failure(format!("exit code {}", code))),
            None => Ok(StepOutcome::failure("terminated by signal")),
        }
    }

    fn environment(&self, step: &StepDefinition, ctx: &StepContext) -> (InterpolationContext, HashMap<String, String>) {
        let interpolation = InterpolationContext::new()
            .with_matrix(&ctx.coordinate)
            .with_variables(&ctx.variables)
            .with_variables(&step.variables);

        let mut env_vars = interpolation.variables.clone();
        env_vars.extend(interpolation.matrix_env());
        env_vars.insert("CONVEYOR_RUN_ID".to_string(), ctx.run_id.to_string());
        env_vars.insert("CONVEYOR_JOB_ID".to_string(), ctx.job_id.to_string());
        env_vars.insert("CONVEYOR_JOB".to_string(), ctx.template_id.to_string());
        env_vars.insert("CI".to_string(), "true".to_string());

        (interpolation, env_vars)
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn run_step(&self, step: &StepDefinition, ctx: &StepContext) -> Result<StepOutcome> {
        if let Some(action) = &step.uses {
            if self.config.skip_actions {
                warn!(job = %ctx.job_id, step = %step.name, %action, "Skipping action step");
                return Ok(StepOutcome::Success);
            }
            return Ok(StepOutcome::failure(format!(
                "action `{}` cannot run in a shell",
                action
            )));
        }

        let command = step
            .run
            .as_ref()
            .ok_or_else(|| Error::StepExecution(format!("Step `{}` has no command to run", step.name)))?;

        let (interpolation, env_vars) = self.environment(step, ctx);
        let command = interpolation.interpolate(command);

        // Handle retries
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                info!(attempt, step = %step.name, "Retrying command");
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }

            let last = attempt == self.config.retry_count;
            match self.execute_command(&command, step, ctx, &env_vars).await {
                Ok(StepOutcome::Success) => return Ok(StepOutcome::Success),
                Ok(outcome) if last => return Ok(outcome),
                Ok(_) => warn!(attempt, step = %step.name, "Command failed, will retry"),
                Err(e) if last => {
                    error!(error = %e, step = %step.name, "Command failed after all retries");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, attempt, step = %step.name, "Command error, will retry"),
            }
            attempt += 1;
        }
    }
}

async fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    job_id: JobId,
    step_name: String,
    sink: Option<mpsc::Sender<OutputLine>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut line_num = 0u32;

    // Lossy decoding keeps the pipe drained whatever bytes the step prints.
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(job = %job_id, step = %step_name, error = %e, "Output stream read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        line_num += 1;
        match stream {
            OutputStream::Stdout => info!(job = %job_id, step = %step_name, "{}", line),
            OutputStream::Stderr => warn!(job = %job_id, step = %step_name, "{}", line),
        }
        if let Some(tx) = &sink {
            let output = OutputLine {
                job_id: job_id.clone(),
                step_name: step_name.clone(),
                stream,
                content: line,
                line_number: line_num,
                timestamp: chrono::Utc::now(),
            };
            // A closed sink only stops forwarding; the process keeps its pipe drained.
            let _ = tx.send(output).await;
        }
    }
}
