//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! They are immutable for the duration of a run.

use crate::ids::TemplateId;
use crate::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub jobs: Vec<JobTemplate>,
    /// Default rule for lifting `needs` edges between matrix jobs.
    #[serde(default)]
    pub correlation: CorrelationPolicy,
    /// Maximum number of concurrently running jobs. Absent means unlimited.
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a definition from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        Ok(definition)
    }

    /// Load and parse a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn template(&self, id: &TemplateId) -> Option<&JobTemplate> {
        self.jobs.iter().find(|job| &job.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Branch globs. For pull requests these apply to the target branch.
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    /// Allowed pull-request actions.
    #[serde(default = "default_pull_request_types")]
    pub types: Vec<String>,
}

pub fn default_pull_request_types() -> Vec<String> {
    vec![
        "opened".to_string(),
        "synchronize".to_string(),
        "reopened".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Push => write!(f, "push"),
            TriggerType::PullRequest => write!(f, "pull_request"),
        }
    }
}

/// Declarative description of one pipeline job before matrix expansion.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub id: TemplateId,
    #[serde(default)]
    pub name: Option<String>,
    /// Event kinds this job applies to. Absent means every kind.
    #[serde(default)]
    pub on: Option<Vec<TriggerType>>,
    #[serde(default)]
    pub needs: Vec<TemplateId>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    /// Overrides the pipeline-level correlation for this job's `needs`.
    #[serde(default)]
    pub correlation: Option<CorrelationPolicy>,
    /// Maximum number of this job's instances running at once.
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

impl JobTemplate {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn applies_to(&self, trigger: TriggerType) -> bool {
        self.on
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&trigger))
    }
}

/// One step of a job. Opaque to the scheduler; interpreted by a step runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub run: Option<String>,
    /// Reference to an external action handled outside the shell runner.
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_minutes: u32,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_step_timeout() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    /// Axis name to ordered values. Axes expand in name order.
    pub axes: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
}

/// How a template-level `needs` edge is lifted onto matrix instances.
///
/// In YAML: `broadcast`, `shared_axes`, or `!axes [php, deps]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationPolicy {
    /// Every dependent instance needs every instance of the dependency.
    #[default]
    Broadcast,
    /// Pair instances whose common axes carry equal values.
    SharedAxes,
    /// Pair instances on the named axes only.
    Axes(Vec<String>),
}

/// Render a matrix value the way it appears in job ids and step variables.
pub fn matrix_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
