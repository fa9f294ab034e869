//! Matrix expansion and dependency lifting as seen through whole runs.

use conveyor_core::ids::{JobId, TemplateId};
use conveyor_core::pipeline::{PipelineDefinition, TriggerType};
use conveyor_core::run::{JobStatus, RunVerdict};
use conveyor_scheduler::{DagBuilder, MatrixExpander};
use conveyor_tests::{AlwaysSucceed, FailOn, Harness, JobFixture, PipelineFixture};
use pretty_assertions::assert_eq;

fn needs_of(pipeline: &PipelineDefinition, job: &str) -> Vec<String> {
    let graph = DagBuilder::new()
        .build_for_event(pipeline, TriggerType::Push)
        .unwrap();
    let mut needs: Vec<String> = graph
        .get(&JobId::new(job))
        .unwrap()
        .needs
        .iter()
        .map(|n| n.to_string())
        .collect();
    needs.sort();
    needs
}

#[test]
fn test_two_by_two_matrix_yields_four_coordinates() {
    let template =
        JobFixture::matrix_job("tests", &[], &[("version", &["a", "b"]), ("deps", &["x", "y"])]);
    let instances = MatrixExpander::new().expand(&template);

    let mut coordinates: Vec<(String, String)> = instances
        .iter()
        .map(|i| {
            (
                i.coordinate.get("version").unwrap().to_string(),
                i.coordinate.get("deps").unwrap().to_string(),
            )
        })
        .collect();
    coordinates.sort();

    let expected: Vec<(String, String)> = [("a", "x"), ("a", "y"), ("b", "x"), ("b", "y")]
        .iter()
        .map(|(v, d)| (v.to_string(), d.to_string()))
        .collect();
    assert_eq!(coordinates, expected);
}

#[tokio::test]
async fn test_empty_axis_removes_the_job_from_the_run() {
    let pipeline = PipelineFixture::with_jobs(vec![
        JobFixture::job("lint", &[]),
        JobFixture::matrix_job("tests", &["lint"], &[("php", &[])]),
        JobFixture::job("report", &["tests"]),
    ]);

    let harness = Harness::new(AlwaysSucceed);
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.jobs.len(), 2);
    assert_eq!(report.not_evaluated, vec![TemplateId::new("tests")]);
    assert_eq!(report.job("report").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.verdict, RunVerdict::Success);
}

#[tokio::test]
async fn test_broadcast_dependent_waits_for_every_instance() {
    let pipeline = PipelineFixture::with_jobs(vec![
        JobFixture::matrix_job("a", &[], &[("php", &["8.1", "8.2"])]),
        JobFixture::job("b", &["a"]),
    ]);
    assert_eq!(needs_of(&pipeline, "b"), vec!["a (php=8.1)", "a (php=8.2)"]);

    let harness = Harness::new(AlwaysSucceed);
    harness.run(&pipeline, TriggerType::Push).await;

    let ready = harness.events.position("b", JobStatus::Ready).await.unwrap();
    for dep in ["a (php=8.1)", "a (php=8.2)"] {
        let done = harness
            .events
            .position(dep, JobStatus::Succeeded)
            .await
            .unwrap();
        assert!(done < ready);
    }
}

#[tokio::test]
async fn test_one_failed_instance_skips_broadcast_dependents() {
    let pipeline = PipelineFixture::with_jobs(vec![
        JobFixture::matrix_job("a", &[], &[("php", &["8.1", "8.2"])]),
        JobFixture::job("b", &["a"]),
    ]);

    let harness = Harness::new(FailOn::jobs(["a (php=8.2)"]));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.job("a (php=8.1)").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.job("b").unwrap().status, JobStatus::Skipped);
}

const CORRELATED: &str = r#"
name: correlated
correlation: shared_axes
jobs:
  - id: install
    matrix:
      axes:
        php: ["8.1", "8.2"]
    steps:
      - name: Install
        run: composer install
  - id: tests
    needs: [install]
    matrix:
      axes:
        php: ["8.1", "8.2"]
        dependencies: [lowest, highest]
    steps:
      - name: Test
        run: vendor/bin/phpunit
  - id: coverage
    needs: [tests]
    correlation: !axes [php]
    matrix:
      axes:
        php: ["8.1", "8.2"]
    steps:
      - name: Upload
        run: bin/upload-coverage
  - id: summary
    needs: [tests]
    correlation: broadcast
    steps:
      - name: Summarize
        run: bin/summary
"#;

#[tokio::test]
async fn test_correlation_policies_from_yaml() {
    let pipeline = PipelineDefinition::from_yaml_str(CORRELATED).unwrap();

    assert_eq!(
        needs_of(&pipeline, "tests (dependencies=lowest, php=8.2)"),
        vec!["install (php=8.2)"]
    );
    assert_eq!(
        needs_of(&pipeline, "coverage (php=8.1)"),
        vec![
            "tests (dependencies=highest, php=8.1)",
            "tests (dependencies=lowest, php=8.1)"
        ]
    );
    assert_eq!(needs_of(&pipeline, "summary").len(), 4);

    // A failing 8.1 install only takes the 8.1 branch down.
    let harness = Harness::new(FailOn::jobs(["install (php=8.1)"]));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    assert_eq!(report.job("coverage (php=8.1)").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.job("coverage (php=8.2)").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.job("summary").unwrap().status, JobStatus::Skipped);
}

#[tokio::test]
async fn test_jobs_limited_to_other_events_are_not_evaluated() {
    let mut release = JobFixture::job("release", &["build"]);
    release.on = Some(vec![TriggerType::Push]);
    let pipeline = PipelineFixture::with_jobs(vec![JobFixture::job("build", &[]), release]);

    let harness = Harness::new(AlwaysSucceed);
    let report = harness.run(&pipeline, TriggerType::PullRequest).await;

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.not_evaluated, vec![TemplateId::new("release")]);
    assert_eq!(report.verdict, RunVerdict::Success);
}

const PARTIAL: &str = r#"
name: partial
jobs:
  - id: install
    matrix:
      axes:
        php: ["8.1", "8.2"]
    steps:
      - name: Install
        run: composer install
  - id: tests
    needs: [install]
    correlation: !axes [php]
    matrix:
      axes:
        php: ["8.1", "8.2", "8.3"]
    steps:
      - name: Test
        run: vendor/bin/phpunit
"#;

#[tokio::test]
async fn test_instance_without_correlated_partner_does_not_wait() {
    let pipeline = PipelineDefinition::from_yaml_str(PARTIAL).unwrap();
    assert!(needs_of(&pipeline, "tests (php=8.3)").is_empty());
    assert_eq!(needs_of(&pipeline, "tests (php=8.2)"), vec!["install (php=8.2)"]);

    let harness = Harness::new(FailOn::jobs(["install (php=8.1)"]));
    let report = harness.run(&pipeline, TriggerType::Push).await;

    // Seeded alongside the roots, before any job has finished.
    let ready = harness
        .events
        .position("tests (php=8.3)", JobStatus::Ready)
        .await
        .unwrap();
    assert!(ready < 3);

    assert_eq!(report.job("tests (php=8.1)").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.job("tests (php=8.2)").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.job("tests (php=8.3)").unwrap().status, JobStatus::Succeeded);
}
