//! Configuration specification types for the provisioning engine.
//!
//! This module defines all the structs that map to the `halldyll.stack.yaml` file.
//! These types are declarative and fully describe the desired state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use validator::Validate;

use crate::graph::{PropertyValue, Resource, ResourceId};

/// The root configuration structure for a Halldyll stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Named values exported after a run.
    #[serde(default)]
    pub exports: BTreeMap<String, PropertyValue>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider service.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EngineConfig {
    /// Maximum number of steps applied concurrently.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub parallelism: usize,
    /// Persist state after every successful step.
    #[serde(default = "default_true")]
    pub checkpoint: bool,
    /// Retry policy for transient provider failures.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    /// Properties that cannot change in place, per resource type.
    #[serde(default)]
    pub replace_on_change: HashMap<String, Vec<String>>,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RetryConfig {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical name, unique per type.
    pub name: String,
    /// Resource type understood by the provider.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from("HALLDYLL_PROVIDER_TOKEN")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    10
}

const fn default_true() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            checkpoint: true,
            retry: RetryConfig::default(),
            replace_on_change: HashMap::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl StackConfig {
    /// Returns the resource declaration with the given identity.
    #[must_use]
    pub fn get_resource(&self, id: &ResourceId) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|r| r.resource_type == id.resource_type && r.name == id.name)
    }
}

impl ResourceConfig {
    /// Returns the logical identity of this declaration.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Converts the declaration into a graph resource.
    #[must_use]
    pub fn to_resource(&self) -> Resource {
        Resource {
            id: self.id(),
            properties: self.properties.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}
