//! Scheduling properties: termination, failure propagation, slot limits,
//! cancellation and run timeouts.

use conveyor_core::events::Event;
use conveyor_core::ids::TemplateId;
use conveyor_core::pipeline::TriggerType;
use conveyor_core::run::{CancelReason, JobStatus, RunVerdict};
use conveyor_scheduler::SchedulerConfig;
use conveyor_scheduler::dag::transitive_needs;
use conveyor_tests::{
    AlwaysSucceed, Delayed, FailOn, Hang, Harness, JobFixture, PipelineFixture, RecordingEventBus,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Highest number of simultaneously running jobs seen in the event stream.
async fn peak_running(events: &RecordingEventBus) -> usize {
    let mut running = 0usize;
    let mut peak = 0;
    for (_, status) in events.transitions().await {
        match status {
            JobStatus::Running => {
                running += 1;
                peak = peak.max(running);
            }
            JobStatus::Succeeded | JobStatus::Failed => running -= 1,
            _ => {}
        }
    }
    peak
}

#[tokio::test]
async fn test_every_dag_terminates_and_failures_propagate() {
    for size in 1..=8usize {
        let ids: Vec<String> = (0..size).map(|i| format!("j{}", i)).collect();
        let jobs = (0..size)
            .map(|i| {
                let needs: Vec<&str> = (0..i)
                    .filter(|j| (i * 7 + j * 3) % 4 == 0)
                    .map(|j| ids[j].as_str())
                    .collect();
                JobFixture::job(&ids[i], &needs)
            })
            .collect();
        let pipeline = PipelineFixture::with_jobs(jobs);

        let failing = &ids[size / 2];
        let harness = Harness::new(FailOn::jobs([failing.as_str()]));
        let report = harness.run(&pipeline, TriggerType::Push).await;

        assert_eq!(report.jobs.len(), size);
        assert!(report.jobs.iter().all(|j| j.status.is_terminal()));
        assert_eq!(report.verdict, RunVerdict::Failure);

        for job in &report.jobs {
            let upstream = transitive_needs(&pipeline, &job.template_id);
            let expected = if &job.id.to_string() == failing {
                JobStatus::Failed
            } else if upstream.contains(&TemplateId::new(failing.as_str())) {
                JobStatus::Skipped
            } else {
                JobStatus::Succeeded
            };
            assert_eq!(job.status, expected, "size {} job {}", size, job.id);
        }
    }
}

#[tokio::test]
async fn test_failure_does_not_stop_independent_branches() {
    let mut pipeline = PipelineFixture::chain(&["build", "test", "deploy"]);
    pipeline.jobs.push(JobFixture::job("docs", &[]));
    pipeline.jobs.push(JobFixture::job("publish_docs", &["docs"]));

    let harness = Harness::new(FailOn::jobs(["build"]));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.job("test").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.job("deploy").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.job("publish_docs").unwrap().status, JobStatus::Succeeded);
    assert!(report.job("deploy").unwrap().reason.as_deref().unwrap().contains("test"));
}

#[tokio::test]
async fn test_first_failing_step_aborts_the_job() {
    let mut job = JobFixture::job("build", &[]);
    job.steps = vec![
        JobFixture::step("compile", "make"),
        JobFixture::step("package", "make dist"),
    ];
    let pipeline = PipelineFixture::with_jobs(vec![job]);

    let harness = Harness::new(FailOn::jobs(["build"]));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    let build = report.job("build").unwrap();
    assert_eq!(build.status, JobStatus::Failed);
    assert_eq!(build.steps.len(), 1);
    assert_eq!(build.steps[0].name, "compile");
}

#[tokio::test(start_paused = true)]
async fn test_slot_limit_bounds_running_jobs() {
    let harness = Harness::with_config(
        Delayed::new(Duration::from_millis(50)),
        SchedulerConfig {
            max_parallel: Some(2),
            ..Default::default()
        },
    );
    let report = harness.run(&PipelineFixture::independent(5), TriggerType::Push).await;

    assert_eq!(report.count(JobStatus::Succeeded), 5);
    assert_eq!(harness.runner.peak(), 2);
    assert_eq!(harness.runner.completed(), 5);
    assert_eq!(peak_running(&harness.events).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_max_parallel_applies() {
    let mut pipeline = PipelineFixture::independent(4);
    pipeline.max_parallel = Some(1);

    let harness = Harness::new(Delayed::new(Duration::from_millis(10)));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.verdict, RunVerdict::Success);
    assert_eq!(harness.runner.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_slots_run_everything_at_once() {
    let harness = Harness::new(Delayed::new(Duration::from_millis(50)));
    harness.run(&PipelineFixture::independent(5), TriggerType::Push).await;
    assert_eq!(harness.runner.peak(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_job_max_parallel_limits_its_instances() {
    let mut tests = JobFixture::matrix_job("tests", &[], &[("php", &["8.1", "8.2", "8.3", "8.4"])]);
    tests.max_parallel = Some(1);
    let pipeline = PipelineFixture::with_jobs(vec![tests, JobFixture::job("lint", &[])]);

    let harness = Harness::new(Delayed::new(Duration::from_millis(10)));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.count(JobStatus::Succeeded), 5);
    // One matrix instance plus lint.
    assert_eq!(harness.runner.peak(), 2);
}

#[tokio::test]
async fn test_zero_max_parallel_is_a_structural_failure() {
    let mut pipeline = PipelineFixture::independent(2);
    pipeline.max_parallel = Some(0);

    let harness = Harness::new(AlwaysSucceed);
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.verdict, RunVerdict::Failure);
    assert!(report.error.is_some());
    assert!(harness.events.events().await.is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_step() {
    let pipeline = PipelineFixture::with_jobs(vec![
        JobFixture::job("a", &["b"]),
        JobFixture::job("b", &["a"]),
        JobFixture::job("c", &[]),
    ]);

    let harness = Harness::new(AlwaysSucceed);
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.verdict, RunVerdict::Failure);
    assert!(report.jobs.is_empty());
    assert_eq!(
        report.not_evaluated,
        vec![TemplateId::new("a"), TemplateId::new("b"), TemplateId::new("c")]
    );
    assert!(report.error.as_deref().unwrap().contains("cycle"));
    assert!(harness.events.events().await.is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let pipeline = PipelineFixture::with_jobs(vec![JobFixture::job("a", &["missing"])]);
    let harness = Harness::new(AlwaysSucceed);
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.verdict, RunVerdict::Failure);
    assert!(report.error.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_cancellation_drains_the_run() {
    let mut pipeline = PipelineFixture::chain(&["build", "test"]);
    pipeline.jobs.push(JobFixture::job("lint", &[]));

    let harness = Arc::new(Harness::new(Hang::new()));
    let cancel = CancellationToken::new();

    let run = {
        let harness = harness.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            harness
                .scheduler
                .start_run(&pipeline, TriggerType::Push, cancel)
                .await
        })
    };

    harness.runner.wait_started(2).await;
    cancel.cancel();
    let report = run.await.unwrap();

    assert_eq!(report.cancelled, Some(CancelReason::UserRequested));
    assert_eq!(report.verdict, RunVerdict::Failure);
    assert_eq!(report.job("build").unwrap().status, JobStatus::Failed);
    assert_eq!(report.job("lint").unwrap().status, JobStatus::Failed);
    assert_eq!(report.job("test").unwrap().status, JobStatus::Skipped);

    let events = harness.events.events().await;
    assert!(events.iter().any(|e| matches!(e, Event::RunCancelled(_))));
    assert!(matches!(events.last(), Some(Event::RunCompleted(_))));
}

#[tokio::test]
async fn test_cancellation_skips_queued_jobs() {
    let harness = Arc::new(Harness::with_config(
        Hang::new(),
        SchedulerConfig {
            max_parallel: Some(1),
            ..Default::default()
        },
    ));
    let cancel = CancellationToken::new();

    let run = {
        let harness = harness.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            harness
                .scheduler
                .start_run(&PipelineFixture::independent(3), TriggerType::Push, cancel)
                .await
        })
    };

    harness.runner.wait_started(1).await;
    cancel.cancel();
    let report = run.await.unwrap();

    assert_eq!(report.count(JobStatus::Failed), 1);
    assert_eq!(report.count(JobStatus::Skipped), 2);
    assert!(report.jobs.iter().all(|j| j.status != JobStatus::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_behaves_like_cancellation() {
    let mut pipeline = PipelineFixture::chain(&["build", "test"]);
    pipeline.timeout_minutes = Some(5);

    let harness = Harness::new(Hang::new());
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.cancelled, Some(CancelReason::Timeout { minutes: 5 }));
    assert_eq!(report.job("build").unwrap().status, JobStatus::Failed);
    assert_eq!(report.job("test").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.verdict, RunVerdict::Failure);
}
