//! Matrix expansion for parallel job generation.

use conveyor_core::pipeline::{JobTemplate, MatrixConfig, matrix_value_to_string};
use conveyor_core::run::{JobInstance, JobStatus, MatrixCoordinate};
use std::collections::BTreeMap;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a template into its concrete instances.
    ///
    /// Output order is deterministic: axes in name order, values in declared
    /// order, first axis varying slowest. Includes are appended at the end.
    pub fn expand(&self, template: &JobTemplate) -> Vec<JobInstance> {
        let coordinates = match &template.matrix {
            Some(matrix) => self.coordinates(matrix),
            None => vec![MatrixCoordinate::new()],
        };

        coordinates
            .into_iter()
            .map(|coordinate| JobInstance {
                id: JobInstance::instance_id(&template.id, &coordinate),
                template_id: template.id.clone(),
                name: self.format_display_name(template.display_name(), &coordinate),
                coordinate,
                needs: vec![],
                steps: template.steps.clone(),
                variables: template.variables.clone(),
                status: JobStatus::Pending,
                started_at: None,
                completed_at: None,
                step_records: vec![],
                reason: None,
            })
            .collect()
    }

    /// Resolve the coordinates of a matrix.
    ///
    /// An axis without values yields no coordinates at all, includes
    /// notwithstanding: the job is not part of the run.
    pub fn coordinates(&self, matrix: &MatrixConfig) -> Vec<MatrixCoordinate> {
        if matrix.axes.values().any(|values| values.is_empty()) {
            return vec![];
        }

        let mut combinations = self.generate_combinations(matrix);

        // Apply excludes
        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        // Apply includes
        for include in &matrix.include {
            let coordinate: MatrixCoordinate = include
                .iter()
                .map(|(k, v)| (k.clone(), matrix_value_to_string(v)))
                .collect();
            if !combinations.contains(&coordinate) {
                combinations.push(coordinate);
            }
        }

        combinations
    }

    fn generate_combinations(&self, matrix: &MatrixConfig) -> Vec<MatrixCoordinate> {
        let mut result: Vec<Vec<(String, String)>> = vec![vec![]];

        for (axis, values) in &matrix.axes {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut extended = combo.clone();
                    extended.push((axis.clone(), matrix_value_to_string(value)));
                    next.push(extended);
                }
            }
            result = next;
        }

        result
            .into_iter()
            .map(|pairs| pairs.into_iter().collect())
            .collect()
    }

    fn matches_exclude(
        &self,
        combo: &MatrixCoordinate,
        exclude: &BTreeMap<String, serde_json::Value>,
    ) -> bool {
        exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(matrix_value_to_string(value).as_str()))
    }

    fn format_display_name(&self, name: &str, coordinate: &MatrixCoordinate) -> String {
        if coordinate.is_empty() {
            return name.to_string();
        }
        let values: Vec<&str> = coordinate.iter().map(|(_, v)| v).collect();
        format!("{} ({})", name, values.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
