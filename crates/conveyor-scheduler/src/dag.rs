//! DAG resolution for pipeline jobs.
//!
//! Dependencies are declared between templates and lifted onto the expanded
//! instances according to the correlation policy.

use crate::matrix::MatrixExpander;
use conveyor_core::ids::{JobId, TemplateId};
use conveyor_core::pipeline::{CorrelationPolicy, JobTemplate, PipelineDefinition, TriggerType};
use conveyor_core::run::{JobInstance, MatrixCoordinate};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Dependency cycle detected: {}", format_cycle(.path))]
    Cycle { path: Vec<TemplateId> },
    #[error("Job `{job}` needs unknown job `{dependency}`")]
    UnknownDependency {
        job: TemplateId,
        dependency: TemplateId,
    },
    #[error("Job id `{0}` is defined more than once")]
    DuplicateJob(TemplateId),
    #[error("Job `{job}` correlates on axis `{axis}` which `{dependency}` or itself does not define")]
    UnknownCorrelationAxis {
        job: TemplateId,
        dependency: TemplateId,
        axis: String,
    },
    #[error("Job `{0}` sets max_parallel to 0")]
    ZeroParallelism(TemplateId),
    #[error("Pipeline sets max_parallel to 0")]
    ZeroSlotLimit,
    #[error("Empty pipeline")]
    EmptyPipeline,
}

fn format_cycle(path: &[TemplateId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<GraphError> for conveyor_core::Error {
    fn from(err: GraphError) -> Self {
        conveyor_core::Error::Graph(err.to_string())
    }
}

/// Directed acyclic graph over the job instances of one run.
///
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct RunGraph {
    graph: DiGraph<JobInstance, ()>,
    index: HashMap<JobId, NodeIndex>,
    group_limits: HashMap<TemplateId, usize>,
    not_evaluated: Vec<TemplateId>,
}

impl RunGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node indices in insertion order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// All instances in insertion order.
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.graph.node_weights()
    }

    pub fn instance(&self, idx: NodeIndex) -> &JobInstance {
        &self.graph[idx]
    }

    pub(crate) fn instance_mut(&mut self, idx: NodeIndex) -> &mut JobInstance {
        &mut self.graph[idx]
    }

    pub fn get(&self, id: &JobId) -> Option<&JobInstance> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn index_of(&self, id: &JobId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Instances that must succeed before `idx` may run.
    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    /// Instances gated on `idx`.
    pub fn dependents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Instances with no dependencies.
    pub fn roots(&self) -> Vec<&JobInstance> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    pub fn topological_order(&self) -> Result<Vec<&JobInstance>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| indices.iter().map(|&idx| &self.graph[idx]).collect())
            .map_err(|cycle| GraphError::Cycle {
                path: vec![self.graph[cycle.node_id()].template_id.clone()],
            })
    }

    /// Concurrency limit for the instances of a template, if any.
    pub fn group_limit(&self, template: &TemplateId) -> Option<usize> {
        self.group_limits.get(template).copied()
    }

    /// Templates that produced no instances for this run.
    pub fn not_evaluated(&self) -> &[TemplateId] {
        &self.not_evaluated
    }
}

/// Builder for constructing run graphs.
pub struct DagBuilder {
    expander: MatrixExpander,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            expander: MatrixExpander::new(),
        }
    }

    /// Validate, expand and link every template applicable to `trigger`.
    pub fn build_for_event(
        &self,
        pipeline: &PipelineDefinition,
        trigger: TriggerType,
    ) -> Result<RunGraph, GraphError> {
        self.validate(pipeline)?;

        let instances = pipeline
            .jobs
            .iter()
            .filter(|template| template.applies_to(trigger))
            .flat_map(|template| self.expander.expand(template))
            .collect();

        self.build(instances, pipeline)
    }

    /// Check template-level structure: ids, references, cycles, limits.
    pub fn validate(&self, pipeline: &PipelineDefinition) -> Result<(), GraphError> {
        if pipeline.jobs.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }
        if pipeline.max_parallel == Some(0) {
            return Err(GraphError::ZeroSlotLimit);
        }

        let mut templates: HashMap<&TemplateId, &JobTemplate> = HashMap::new();
        for template in &pipeline.jobs {
            if templates.insert(&template.id, template).is_some() {
                return Err(GraphError::DuplicateJob(template.id.clone()));
            }
            if template.max_parallel == Some(0) {
                return Err(GraphError::ZeroParallelism(template.id.clone()));
            }
        }

        for template in &pipeline.jobs {
            for dep in &template.needs {
                let Some(dependency) = templates.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        job: template.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                let policy = template.correlation.as_ref().unwrap_or(&pipeline.correlation);
                if let CorrelationPolicy::Axes(axes) = policy {
                    for axis in axes {
                        if !declares_axis(template, axis) || !declares_axis(dependency, axis) {
                            return Err(GraphError::UnknownCorrelationAxis {
                                job: template.id.clone(),
                                dependency: dep.clone(),
                                axis: axis.clone(),
                            });
                        }
                    }
                }
            }
        }

        detect_cycle(&pipeline.jobs)
    }

    /// Link already-expanded instances using the templates' `needs`.
    ///
    /// Templates without instances are recorded as not evaluated; their
    /// dependents have nothing to wait for on their account.
    pub fn build(
        &self,
        instances: Vec<JobInstance>,
        pipeline: &PipelineDefinition,
    ) -> Result<RunGraph, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut by_template: HashMap<TemplateId, Vec<NodeIndex>> = HashMap::new();

        for instance in instances {
            if index.contains_key(&instance.id) {
                return Err(GraphError::DuplicateJob(instance.template_id.clone()));
            }
            let id = instance.id.clone();
            let template_id = instance.template_id.clone();
            let idx = graph.add_node(instance);
            index.insert(id, idx);
            by_template.entry(template_id).or_default().push(idx);
        }

        let mut not_evaluated = Vec::new();
        let mut group_limits = HashMap::new();

        for template in &pipeline.jobs {
            let Some(dependents) = by_template.get(&template.id) else {
                not_evaluated.push(template.id.clone());
                continue;
            };
            if let Some(limit) = template.max_parallel {
                group_limits.insert(template.id.clone(), limit as usize);
            }

            let policy = template.correlation.as_ref().unwrap_or(&pipeline.correlation);

            for dep in &template.needs {
                if !pipeline.jobs.iter().any(|t| &t.id == dep) {
                    return Err(GraphError::UnknownDependency {
                        job: template.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                let Some(dependencies) = by_template.get(dep) else {
                    continue;
                };

                for &dependent_idx in dependents {
                    let mut paired = 0;
                    for &dep_idx in dependencies {
                        if !pairs(
                            policy,
                            &graph[dep_idx].coordinate,
                            &graph[dependent_idx].coordinate,
                        ) {
                            continue;
                        }
                        paired += 1;
                        if graph.contains_edge(dep_idx, dependent_idx) {
                            continue;
                        }
                        graph.add_edge(dep_idx, dependent_idx, ());
                        let dep_id = graph[dep_idx].id.clone();
                        graph[dependent_idx].needs.push(dep_id);
                    }
                    if paired == 0 {
                        warn!(
                            job = %graph[dependent_idx].id,
                            dependency = %dep,
                            "No correlated instance found; job does not wait on this dependency"
                        );
                    }
                }
            }
        }

        let run_graph = RunGraph {
            graph,
            index,
            group_limits,
            not_evaluated,
        };

        // Verify no cycles
        run_graph.topological_order()?;

        Ok(run_graph)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn declares_axis(template: &JobTemplate, axis: &str) -> bool {
    template.matrix.as_ref().is_some_and(|m| {
        m.axes.contains_key(axis) || m.include.iter().any(|inc| inc.contains_key(axis))
    })
}

/// Whether an instance at `dependent` must wait on one at `dependency`.
fn pairs(
    policy: &CorrelationPolicy,
    dependency: &MatrixCoordinate,
    dependent: &MatrixCoordinate,
) -> bool {
    match policy {
        CorrelationPolicy::Broadcast => true,
        CorrelationPolicy::SharedAxes => dependency
            .iter()
            .all(|(axis, value)| dependent.get(axis).is_none_or(|v| v == value)),
        CorrelationPolicy::Axes(axes) => axes
            .iter()
            .all(|axis| dependency.get(axis) == dependent.get(axis)),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search over template `needs` with recursion-stack marking.
fn detect_cycle(templates: &[JobTemplate]) -> Result<(), GraphError> {
    let by_id: HashMap<&TemplateId, &JobTemplate> = templates.iter().map(|t| (&t.id, t)).collect();
    let mut marks: HashMap<&TemplateId, Mark> = HashMap::new();
    let mut stack: Vec<&TemplateId> = Vec::new();

    fn visit<'a>(
        id: &'a TemplateId,
        by_id: &HashMap<&'a TemplateId, &'a JobTemplate>,
        marks: &mut HashMap<&'a TemplateId, Mark>,
        stack: &mut Vec<&'a TemplateId>,
    ) -> Result<(), GraphError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<TemplateId> =
                    stack[start..].iter().map(|s| (*s).clone()).collect();
                path.push(id.clone());
                return Err(GraphError::Cycle { path });
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(template) = by_id.get(id) {
            for dep in &template.needs {
                visit(dep, by_id, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for template in templates {
        visit(&template.id, &by_id, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// Unique template ids reachable from `id` through `needs`, excluding itself.
pub fn transitive_needs(pipeline: &PipelineDefinition, id: &TemplateId) -> HashSet<TemplateId> {
    let mut seen = HashSet::new();
    let mut frontier = vec![id.clone()];
    while let Some(current) = frontier.pop() {
        if let Some(template) = pipeline.template(&current) {
            for dep in &template.needs {
                if seen.insert(dep.clone()) {
                    frontier.push(dep.clone());
                }
            }
        }
    }
    seen
}
