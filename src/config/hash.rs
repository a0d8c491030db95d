//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of stacks and property sets so
//! a snapshot can record what it was produced from.

use sha2::{Digest, Sha256};

use super::spec::{ResourceConfig, StackConfig};
use crate::graph::Properties;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole stack declaration.
    ///
    /// Resources are hashed sorted by identity, so reordering declarations
    /// does not change the result.
    #[must_use]
    pub fn hash_stack(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        let mut resources: Vec<&ResourceConfig> = config.resources.iter().collect();
        resources.sort_by_key(|r| r.id());
        for resource in resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        for (name, value) in &config.exports {
            hasher.update(name.as_bytes());
            hasher.update(canonical_json(value).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id().to_string().as_bytes());
        hasher.update(canonical_json(&resource.properties).as_bytes());

        let mut deps: Vec<String> = resource.depends_on.iter().map(ToString::to_string).collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of concrete property values.
    #[must_use]
    pub fn hash_properties(&self, properties: &Properties) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(properties).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash (first 12 characters).
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        &hash[..12.min(hash.len())]
    }
}

/// Serializes with sorted object keys.
///
/// `serde_json` keeps maps in a `BTreeMap` unless `preserve_order` is
/// enabled, so serializing through `Value` sorts nested keys too.
fn canonical_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use serde_json::json;

    fn stack(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parses")
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let props = Properties::from([
            (String::from("bucket"), json!("logs")),
            (String::from("tags"), json!({ "b": 1, "a": 2 })),
        ]);

        assert_eq!(hasher.hash_properties(&props), hasher.hash_properties(&props));
        assert_eq!(hasher.hash_properties(&props).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_properties() {
        let hasher = ConfigHasher::new();
        let a = Properties::from([(String::from("acl"), json!("private"))]);
        let b = Properties::from([(String::from("acl"), json!("public-read"))]);
        assert_ne!(hasher.hash_properties(&a), hasher.hash_properties(&b));
    }

    #[test]
    fn test_stack_hash_ignores_declaration_order() {
        let hasher = ConfigHasher::new();
        let first = stack(
            r"
project: { name: demo }
resources:
  - { name: a, type: bucket, properties: { bucket: a } }
  - { name: b, type: bucket, properties: { bucket: b } }
",
        );
        let second = stack(
            r"
project: { name: demo }
resources:
  - { name: b, type: bucket, properties: { bucket: b } }
  - { name: a, type: bucket, properties: { bucket: a } }
",
        );
        assert_eq!(hasher.hash_stack(&first), hasher.hash_stack(&second));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ConfigHasher::short_hash("abcdef1234567890"), "abcdef123456");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }
}
