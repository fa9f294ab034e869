//! `${{ ... }}` expression substitution for step commands.

use conveyor_core::run::MatrixCoordinate;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    // Nesting not supported
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("expression pattern is valid")
});

/// Values visible to step expressions.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline, job and step variables, later layers winning.
    pub variables: HashMap<String, String>,
    /// Matrix values for the current job.
    pub matrix: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matrix(mut self, coordinate: &MatrixCoordinate) -> Self {
        self.matrix = coordinate
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn with_variables(mut self, variables: &HashMap<String, String>) -> Self {
        self.variables
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ variable }}` - direct variable lookup
    /// - `${{ env.VAR }}` - variable, falling back to the process environment
    /// - `${{ matrix.key }}` - matrix value
    ///
    /// Unknown names resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .into_owned()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }

    /// Environment variables exposing the matrix to the step process.
    ///
    /// `php` becomes `MATRIX_PHP`; non-alphanumerics turn into underscores.
    pub fn matrix_env(&self) -> HashMap<String, String> {
        self.matrix
            .iter()
            .map(|(axis, value)| {
                let name: String = axis
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                (format!("MATRIX_{}", name), value.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> InterpolationContext {
        let coordinate: MatrixCoordinate =
            [("php", "8.2"), ("dependency-versions", "lowest")].into_iter().collect();
        let variables: HashMap<String, String> =
            [("COMPOSER_FLAGS".to_string(), "--prefer-dist".to_string())].into();
        InterpolationContext::new()
            .with_matrix(&coordinate)
            .with_variables(&variables)
    }

    #[test]
    fn test_matrix_and_variables() {
        let ctx = context();
        assert_eq!(
            ctx.interpolate("php${{ matrix.php }} composer install ${{COMPOSER_FLAGS}}"),
            "php8.2 composer install --prefer-dist"
        );
        assert_eq!(ctx.interpolate("${{ env.COMPOSER_FLAGS }}"), "--prefer-dist");
    }

    #[test]
    fn test_unknown_names_are_empty() {
        let ctx = context();
        assert_eq!(ctx.interpolate("[${{ matrix.os }}]"), "[]");
        assert_eq!(ctx.interpolate("no expressions"), "no expressions");
    }

    #[test]
    fn test_matrix_env_names() {
        let env = context().matrix_env();
        assert_eq!(env.get("MATRIX_PHP").map(String::as_str), Some("8.2"));
        assert_eq!(
            env.get("MATRIX_DEPENDENCY_VERSIONS").map(String::as_str),
            Some("lowest")
        );
    }
}
