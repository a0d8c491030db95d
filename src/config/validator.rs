//! Configuration validation for stack files.
//!
//! This module validates stack configurations before anything touches state
//! or a provider, so that malformed declarations fail fast.

use crate::error::{ConfigError, HalldyllError, Result};
use std::collections::HashSet;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{ProjectConfig, ResourceConfig, StackConfig, StateBackend};
use crate::graph::PropertyValue;

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(HalldyllError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_engine(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_exports(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates the state backend.
    fn validate_state(config: &StackConfig, result: &mut ValidationResult) {
        if config.state.backend == StateBackend::S3
            && config.state.bucket.as_deref().is_none_or(str::is_empty)
        {
            result.error("state.bucket", "S3 state backend requires a bucket");
        }
    }

    /// Validates engine tuning through its derived range checks.
    fn validate_engine(config: &StackConfig, result: &mut ValidationResult) {
        if let Err(errors) = config.engine.validate() {
            flatten_errors("engine", &errors, result);
        }

        let retry = &config.engine.retry;
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "engine.retry.initial_backoff_ms",
                "Initial backoff cannot exceed max backoff",
            );
        }

        for (resource_type, properties) in &config.engine.replace_on_change {
            if !is_valid_type(resource_type) {
                result.error(
                    format!("engine.replace_on_change.{resource_type}"),
                    format!("'{resource_type}' is not a valid resource type"),
                );
            }
            if properties.is_empty() {
                result.warning(format!(
                    "engine.replace_on_change.{resource_type} lists no properties"
                ));
            }
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{field}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            if !is_valid_type(&resource.resource_type) {
                result.error(
                    format!("{field}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must match [a-z][a-z0-9_:]*.",
                        resource.resource_type
                    ),
                );
            }

            if !seen.insert(resource.id()) {
                result.error(
                    format!("{field}.name"),
                    format!("Duplicate resource '{}'", resource.id()),
                );
            }

            if resource.properties.is_empty() {
                result.warning(format!("Resource '{}' declares no properties", resource.id()));
            }

            for (key, value) in &resource.properties {
                if let PropertyValue::Literal(literal) = value
                    && contains_ref_key(literal)
                {
                    result.error(
                        format!("{field}.properties.{key}"),
                        "Malformed reference: expected exactly `$ref: <type>.<name>` and `output: <name>`",
                    );
                }
            }
        }
    }

    /// Validates exports.
    fn validate_exports(config: &StackConfig, result: &mut ValidationResult) {
        for (name, value) in &config.exports {
            let field = format!("exports.{name}");

            if !is_valid_export_name(name) {
                result.error(
                    field.clone(),
                    format!("Export name '{name}' must be an identifier ([a-z_][a-z0-9_]*)"),
                );
            }

            match value {
                PropertyValue::Reference(reference) => {
                    if config.get_resource(&reference.target).is_none() {
                        result.error(
                            field,
                            format!("Export references undeclared resource '{}'", reference.target),
                        );
                    }
                }
                PropertyValue::Literal(literal) => {
                    if contains_ref_key(literal) {
                        result.error(field, "Malformed reference in export");
                    }
                }
            }
        }
    }
}

/// Copies derived validation errors into the result.
fn flatten_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, kind) in errors.errors() {
        let path = format!("{prefix}.{field}");
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| format!("{path} is out of range ({})", error.code), ToString::to_string);
                    result.error(path.clone(), message);
                }
            }
            ValidationErrorsKind::Struct(nested) => flatten_errors(&path, nested, result),
            ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    flatten_errors(&format!("{path}[{idx}]"), nested, result);
                }
            }
        }
    }
}

/// Returns true if a literal contains a `$ref` key anywhere.
fn contains_ref_key(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            map.contains_key("$ref") || map.values().any(contains_ref_key)
        }
        serde_json::Value::Array(items) => items.iter().any(contains_ref_key),
        _ => false,
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource types: a lowercase letter, then lowercase alphanumerics, `_` or `:`.
fn is_valid_type(resource_type: &str) -> bool {
    let mut chars = resource_type.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == ':')
}

fn is_valid_export_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ValidationResult {
    /// Records an error.
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Records a warning.
    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test yaml parses")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("my-test-bucket"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("web-01"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("My-Bucket"));
        assert!(!is_valid_name("1-bucket"));
        assert!(!is_valid_name("my_bucket"));
        assert!(!is_valid_name("bucket-"));
        assert!(!is_valid_name("my--bucket"));
    }

    #[test]
    fn test_resource_types() {
        assert!(is_valid_type("bucket"));
        assert!(is_valid_type("aws:s3_bucket"));
        assert!(!is_valid_type("Bucket"));
        assert!(!is_valid_type("s3.bucket"));
        assert!(!is_valid_type(""));
    }

    #[test]
    fn test_valid_stack_passes() {
        let config = parse(
            r"
project:
  name: my-stack
resources:
  - name: my-test-bucket
    type: bucket
    properties:
      bucket: my-test-bucket
exports:
  bucket_arn: { $ref: bucket.my-test-bucket, output: arn }
",
        );
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_parallelism_range() {
        let config = parse(
            r"
project:
  name: my-stack
engine:
  parallelism: 0
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "engine.parallelism"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(
            r"
project:
  name: my-stack
state:
  backend: s3
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_malformed_reference_is_rejected() {
        let config = parse(
            r"
project:
  name: my-stack
resources:
  - name: policy
    type: policy
    properties:
      target: { $ref: not-an-identity, output: arn }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.field == "resources[0].properties.target")
        );
    }

    #[test]
    fn test_export_to_undeclared_resource() {
        let config = parse(
            r"
project:
  name: my-stack
exports:
  bucket_arn: { $ref: bucket.ghost, output: arn }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "exports.bucket_arn"));
    }

    #[test]
    fn test_empty_properties_warns() {
        let config = parse(
            r"
project:
  name: my-stack
resources:
  - name: marker
    type: flag
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
