//! Configuration parser for loading stack files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, HalldyllError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::StackConfig;

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(HalldyllError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack '{}' with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `HALLDYLL_<SECTION>_<KEY>` (e.g., `HALLDYLL_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies overrides looked up through `lookup`.
    fn apply_env_overrides(config: &mut StackConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("HALLDYLL_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("HALLDYLL_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(bucket) = lookup("HALLDYLL_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("HALLDYLL_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup("HALLDYLL_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(raw) = lookup("HALLDYLL_PARALLELISM") {
            match raw.parse() {
                Ok(parallelism) => {
                    debug!("Overriding engine.parallelism from environment");
                    config.engine.parallelism = parallelism;
                }
                Err(_) => warn!("Ignoring HALLDYLL_PARALLELISM={raw}: not a number"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalldyllError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the provider token from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn get_provider_token(token_env: &str) -> Result<String> {
        std::env::var(token_env).map_err(|_| {
            HalldyllError::Config(ConfigError::MissingEnvVar {
                name: token_env.to_string(),
            })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.stack.yaml",
    "halldyll.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalldyllError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::graph::{PropertyValue, ResourceId};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal config parses");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.parallelism, 10);
        assert!(config.engine.checkpoint);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_bucket_stack() {
        let yaml = r#"
project:
  name: my-stack
  environment: dev

state:
  backend: s3
  bucket: halldyll-state
  prefix: my-stack/dev

engine:
  parallelism: 4
  replace_on_change:
    bucket: [bucket]

resources:
  - name: my-test-bucket
    type: bucket
    properties:
      bucket: my-test-bucket
      tags:
        Environment: dev
        ManagedBy: halldyll
  - name: read-logs
    type: policy
    properties:
      resource: { $ref: bucket.my-test-bucket, output: arn }
    depends_on: ["bucket.my-test-bucket"]

exports:
  bucket_name: { $ref: bucket.my-test-bucket, output: bucket }
  bucket_arn: { $ref: bucket.my-test-bucket, output: arn }
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("stack parses");

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.engine.parallelism, 4);
        assert_eq!(config.resources.len(), 2);

        let bucket = &config.resources[0];
        assert_eq!(bucket.id(), ResourceId::new("bucket", "my-test-bucket"));
        assert_eq!(
            bucket.properties["tags"],
            PropertyValue::Literal(json!({ "Environment": "dev", "ManagedBy": "halldyll" }))
        );

        let policy = &config.resources[1];
        let reference = policy.properties["resource"]
            .as_reference()
            .expect("resource is a reference");
        assert_eq!(reference.target, bucket.id());
        assert_eq!(reference.output, "arn");
        assert_eq!(policy.depends_on, vec![bucket.id()]);

        assert_eq!(config.exports.len(), 2);
        assert!(config.exports["bucket_arn"].as_reference().is_some());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: base\n", None)
            .expect("parses");

        let vars: HashMap<&str, &str> = HashMap::from([
            ("HALLDYLL_PROJECT_NAME", "override"),
            ("HALLDYLL_PROVIDER_ENDPOINT", "http://provider:8080"),
            ("HALLDYLL_PARALLELISM", "3"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, |name| {
            vars.get(name).map(|v| (*v).to_string())
        });

        assert_eq!(config.project.name, "override");
        assert_eq!(
            config.provider.endpoint.as_deref(),
            Some("http://provider:8080")
        );
        assert_eq!(config.engine.parallelism, 3);
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", None)
            .expect_err("invalid yaml");
        assert!(matches!(
            err,
            HalldyllError::Config(ConfigError::ParseError { .. })
        ));
    }
}
