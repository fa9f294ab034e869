//! Trigger matching and evaluation.

use conveyor_core::pipeline::{PipelineDefinition, TriggerConfig, TriggerType, default_pull_request_types};
use glob_match::glob_match;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source-control event that may start a run.
///
/// Metadata is optional on the wire so that incomplete payloads can be
/// rejected instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        #[serde(default)]
        branch: Option<String>,
    },
    PullRequest {
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        target_branch: Option<String>,
    },
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        TriggerEvent::Push {
            branch: Some(branch.into()),
        }
    }

    pub fn pull_request(action: impl Into<String>) -> Self {
        TriggerEvent::PullRequest {
            action: Some(action.into()),
            target_branch: None,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::PullRequest { .. } => TriggerType::PullRequest,
        }
    }
}

/// Result of evaluating an event against the pipeline triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunDecision {
    Accepted { trigger: TriggerType },
    Rejected { reason: RejectReason },
}

impl RunDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RunDecision::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The event lacks metadata its kind requires.
    MissingMetadata { field: &'static str },
    /// No trigger is configured for this event kind.
    NoMatchingTrigger { kind: TriggerType },
    BranchNotMatched { branch: String },
    ActionNotAllowed { action: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingMetadata { field } => {
                write!(f, "event is missing required field `{}`", field)
            }
            RejectReason::NoMatchingTrigger { kind } => {
                write!(f, "no trigger configured for {} events", kind)
            }
            RejectReason::BranchNotMatched { branch } => {
                write!(f, "branch `{}` matches no trigger pattern", branch)
            }
            RejectReason::ActionNotAllowed { action } => {
                write!(f, "pull request action `{}` does not start a run", action)
            }
        }
    }
}

/// Decides whether an event should start a pipeline run.
pub struct TriggerEvaluator {
    triggers: Vec<TriggerConfig>,
}

impl TriggerEvaluator {
    pub fn new(triggers: Vec<TriggerConfig>) -> Self {
        Self { triggers }
    }

    /// With no triggers configured, pushes to any branch and pull requests
    /// with the default actions start a run.
    pub fn for_pipeline(pipeline: &PipelineDefinition) -> Self {
        if pipeline.triggers.is_empty() {
            return Self::new(vec![
                TriggerConfig {
                    trigger_type: TriggerType::Push,
                    branches: vec![],
                    branches_ignore: vec![],
                    types: default_pull_request_types(),
                },
                TriggerConfig {
                    trigger_type: TriggerType::PullRequest,
                    branches: vec![],
                    branches_ignore: vec![],
                    types: default_pull_request_types(),
                },
            ]);
        }
        Self::new(pipeline.triggers.clone())
    }

    /// Evaluate an event. Pure: never fails, never has side effects.
    pub fn evaluate(&self, event: &TriggerEvent) -> RunDecision {
        let kind = event.trigger_type();
        let candidates: Vec<&TriggerConfig> = self
            .triggers
            .iter()
            .filter(|t| t.trigger_type == kind)
            .collect();

        match event {
            TriggerEvent::Push { branch } => {
                let Some(branch) = branch.as_deref().map(normalize_ref).filter(|b| !b.is_empty())
                else {
                    return rejected(RejectReason::MissingMetadata { field: "branch" });
                };
                if candidates.is_empty() {
                    return rejected(RejectReason::NoMatchingTrigger { kind });
                }
                if candidates.iter().any(|t| branch_matches(t, branch)) {
                    RunDecision::Accepted { trigger: kind }
                } else {
                    rejected(RejectReason::BranchNotMatched {
                        branch: branch.to_string(),
                    })
                }
            }
            TriggerEvent::PullRequest {
                action,
                target_branch,
            } => {
                let Some(action) = action.as_deref().filter(|a| !a.is_empty()) else {
                    return rejected(RejectReason::MissingMetadata { field: "action" });
                };
                if candidates.is_empty() {
                    return rejected(RejectReason::NoMatchingTrigger { kind });
                }

                let allowed: Vec<&&TriggerConfig> = candidates
                    .iter()
                    .filter(|t| t.types.iter().any(|a| a == action))
                    .collect();
                if allowed.is_empty() {
                    return rejected(RejectReason::ActionNotAllowed {
                        action: action.to_string(),
                    });
                }

                let needs_branch = allowed
                    .iter()
                    .all(|t| !t.branches.is_empty() || !t.branches_ignore.is_empty());
                match target_branch.as_deref().map(normalize_ref) {
                    Some(target) => {
                        if allowed.iter().any(|t| branch_matches(t, target)) {
                            RunDecision::Accepted { trigger: kind }
                        } else {
                            rejected(RejectReason::BranchNotMatched {
                                branch: target.to_string(),
                            })
                        }
                    }
                    None if needs_branch => {
                        rejected(RejectReason::MissingMetadata {
                            field: "target_branch",
                        })
                    }
                    None => RunDecision::Accepted { trigger: kind },
                }
            }
        }
    }
}

fn rejected(reason: RejectReason) -> RunDecision {
    RunDecision::Rejected { reason }
}

fn normalize_ref(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

fn branch_matches(trigger: &TriggerConfig, branch: &str) -> bool {
    if trigger.branches_ignore.iter().any(|p| glob_match(p, branch)) {
        return false;
    }
    if trigger.branches.is_empty() {
        return true; // Match all branches if no patterns specified
    }
    trigger.branches.iter().any(|p| glob_match(p, branch))
}
