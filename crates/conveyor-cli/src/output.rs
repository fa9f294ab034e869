//! Terminal rendering of plans and reports.

use conveyor_core::run::{JobStatus, RunVerdict};
use conveyor_scheduler::{RunGraph, RunReport};
use console::style;
use std::fmt::Write;

fn status_marker(status: JobStatus) -> String {
    match status {
        JobStatus::Succeeded => style("✓").green().to_string(),
        JobStatus::Failed => style("✗").red().to_string(),
        JobStatus::Skipped => style("-").dim().to_string(),
        _ => style("?").yellow().to_string(),
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Human-readable run summary.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();

    let trigger = report
        .trigger
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "{} {} ({}, {})",
        style("Run").bold(),
        report.run_id,
        report.pipeline_name,
        trigger
    );

    if let Some(error) = &report.error {
        let _ = writeln!(out, "  {} {}", style("error:").red().bold(), error);
    }

    let width = report
        .jobs
        .iter()
        .map(|j| j.id.as_str().len())
        .max()
        .unwrap_or(0);
    for job in &report.jobs {
        let duration = job.duration_ms.map(format_duration).unwrap_or_default();
        let _ = write!(
            out,
            "  {} {:width$}  {:9}  {:>8}",
            status_marker(job.status),
            job.id.as_str(),
            job.status.to_string(),
            duration,
            width = width
        );
        if let Some(reason) = &job.reason {
            let _ = write!(out, "  {}", style(reason).dim());
        }
        out.push('\n');
    }

    if !report.not_evaluated.is_empty() {
        let names: Vec<&str> = report.not_evaluated.iter().map(|t| t.as_str()).collect();
        let _ = writeln!(out, "  {} {}", style("not evaluated:").dim(), names.join(", "));
    }

    if let Some(reason) = &report.cancelled {
        let _ = writeln!(out, "  {} {}", style("cancelled:").yellow(), reason);
    }

    let verdict = match report.verdict {
        RunVerdict::Success => style("SUCCESS").green().bold(),
        RunVerdict::Failure => style("FAILURE").red().bold(),
    };
    let _ = writeln!(
        out,
        "{} {} succeeded, {} failed, {} skipped in {}",
        verdict,
        report.count(JobStatus::Succeeded),
        report.count(JobStatus::Failed),
        report.count(JobStatus::Skipped),
        format_duration(report.duration_ms)
    );

    out
}

/// Jobs in a valid execution order with their resolved dependencies.
pub fn render_plan(graph: &RunGraph) -> String {
    let mut out = String::new();
    let order = match graph.topological_order() {
        Ok(order) => order,
        Err(e) => return format!("{}\n", e),
    };

    let _ = writeln!(out, "{} {} jobs", style("Plan:").bold(), graph.len());
    for instance in order {
        let _ = writeln!(out, "  {} {}", style("•").cyan(), instance.id);
        for need in &instance.needs {
            let _ = writeln!(out, "      {} {}", style("needs").dim(), need);
        }
    }

    if !graph.not_evaluated().is_empty() {
        let names: Vec<&str> = graph.not_evaluated().iter().map(|t| t.as_str()).collect();
        let _ = writeln!(out, "  {} {}", style("not evaluated:").dim(), names.join(", "));
    }
    out
}
