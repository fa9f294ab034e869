//! Test fixtures for creating sample pipelines.

use conveyor_core::ids::TemplateId;
use conveyor_core::pipeline::{
    CorrelationPolicy, JobTemplate, MatrixConfig, PipelineDefinition, StepDefinition,
};
use std::collections::HashMap;

/// The continuous-integration pipeline of a PHP library.
pub const PHP_PIPELINE: &str = r#"
name: continuous-integration
triggers:
  - type: push
    branches: ["*.*.x"]
  - type: pull_request
    types: [opened, synchronize, reopened]

jobs:
  - id: byte_level
    name: Byte-level checks
    steps:
      - name: Check file permissions
        run: bin/check-permissions
      - name: Check for tabs
        run: bin/check-tabs src tests

  - id: syntax_errors
    name: Syntax errors
    steps:
      - name: Lint PHP files
        run: bin/lint src tests

  - id: php_tests
    name: PHPUnit
    needs: [byte_level, syntax_errors]
    matrix:
      axes:
        php: ["8.1", "8.2", "8.3"]
        dependencies: [lowest, highest]
    steps:
      - name: Install dependencies
        run: composer update --prefer-${{ matrix.dependencies }}
      - name: Run PHPUnit
        run: vendor/bin/phpunit

  - id: js_tests
    name: JavaScript tests
    needs: [byte_level, syntax_errors]
    steps:
      - name: Run Jest
        run: npm test

  - id: static_analysis
    name: Static analysis
    needs: [byte_level, syntax_errors]
    matrix:
      axes:
        php: ["8.3"]
    steps:
      - name: Run PHPStan
        run: vendor/bin/phpstan analyse

  - id: coding_standards
    name: Coding standards
    needs: [byte_level, syntax_errors]
    steps:
      - name: Run PHPCS
        run: vendor/bin/phpcs

  - id: rector_checkstyle
    name: Rector
    needs: [byte_level, syntax_errors]
    steps:
      - name: Run Rector
        run: vendor/bin/rector --dry-run

  - id: exported_files
    name: Exported files
    needs: [byte_level, syntax_errors]
    steps:
      - name: Check export-ignore
        run: bin/check-exported-files
"#;

/// Factory for creating test pipelines.
pub struct PipelineFixture;

impl PipelineFixture {
    /// The PHP library pipeline, 13 instances on every event kind.
    pub fn php() -> PipelineDefinition {
        PipelineDefinition::from_yaml_str(PHP_PIPELINE).expect("PHP fixture parses")
    }

    /// A pipeline over the given jobs with broadcast correlation and no limits.
    pub fn with_jobs(jobs: Vec<JobTemplate>) -> PipelineDefinition {
        PipelineDefinition {
            version: "1".to_string(),
            name: "test-pipeline".to_string(),
            description: None,
            triggers: vec![],
            variables: HashMap::new(),
            jobs,
            correlation: CorrelationPolicy::Broadcast,
            max_parallel: None,
            timeout_minutes: None,
        }
    }

    /// `n` jobs without dependencies.
    pub fn independent(n: usize) -> PipelineDefinition {
        Self::with_jobs((0..n).map(|i| JobFixture::job(&format!("job_{}", i), &[])).collect())
    }

    /// Jobs where each needs the previous one.
    pub fn chain(ids: &[&str]) -> PipelineDefinition {
        let jobs = ids
            .iter()
            .enumerate()
            .map(|(i, id)| match i {
                0 => JobFixture::job(id, &[]),
                _ => JobFixture::job(id, &[ids[i - 1]]),
            })
            .collect();
        Self::with_jobs(jobs)
    }
}

/// Factory for job templates.
pub struct JobFixture;

impl JobFixture {
    /// A single-step job.
    pub fn job(id: &str, needs: &[&str]) -> JobTemplate {
        JobTemplate {
            id: TemplateId::new(id),
            name: None,
            on: None,
            needs: needs.iter().map(|n| TemplateId::new(*n)).collect(),
            matrix: None,
            correlation: None,
            max_parallel: None,
            variables: HashMap::new(),
            steps: vec![Self::step(&format!("{} step", id), "true")],
        }
    }

    /// A single-step job with string-valued matrix axes.
    pub fn matrix_job(id: &str, needs: &[&str], axes: &[(&str, &[&str])]) -> JobTemplate {
        let mut job = Self::job(id, needs);
        job.matrix = Some(MatrixConfig {
            axes: axes
                .iter()
                .map(|(axis, values)| {
                    (
                        axis.to_string(),
                        values.iter().map(|v| serde_json::json!(v)).collect(),
                    )
                })
                .collect(),
            include: vec![],
            exclude: vec![],
        });
        job
    }

    pub fn step(name: &str, run: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            run: Some(run.to_string()),
            uses: None,
            with: HashMap::new(),
            shell: "sh".to_string(),
            working_directory: None,
            variables: HashMap::new(),
            timeout_minutes: 30,
        }
    }
}
