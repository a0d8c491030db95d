//! Resource declaration types.
//!
//! A resource is identified by its logical identity (type + name), carries a
//! map of desired properties, and may reference outputs of other resources.
//! References stay unresolved until the executor has applied the target.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

/// Concrete property or output values, keyed by attribute name.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Logical identity of a resource: its type and user-assigned name.
///
/// The text form is `type.name`, e.g. `bucket.my-test-bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type understood by the provider.
    pub resource_type: String,
    /// User-assigned logical name.
    pub name: String,
}

impl ResourceId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| GraphError::InvalidIdentity {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (resource_type, name) = s
            .split_once('.')
            .ok_or_else(|| invalid("expected '<type>.<name>'"))?;

        if resource_type.is_empty() {
            return Err(invalid("resource type is empty"));
        }
        if name.is_empty() {
            return Err(invalid("resource name is empty"));
        }

        Ok(Self::new(resource_type, name))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A typed edge from a property to another resource's computed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    /// The referenced resource.
    #[serde(rename = "$ref")]
    pub target: ResourceId,
    /// Name of the output on the referenced resource.
    pub output: String,
}

impl Reference {
    /// Creates a reference to `output` of `target`.
    #[must_use]
    pub fn new(target: ResourceId, output: impl Into<String>) -> Self {
        Self {
            target,
            output: output.into(),
        }
    }

    /// Looks the referenced value up in a set of outputs.
    #[must_use]
    pub fn lookup<'o>(
        &self,
        outputs: &'o BTreeMap<ResourceId, Properties>,
    ) -> Option<&'o serde_json::Value> {
        outputs
            .get(&self.target)
            .and_then(|props| props.get(&self.output))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.output)
    }
}

/// A desired property value: either known now, or a placeholder for another
/// resource's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Deferred value resolved from a dependency's outputs.
    Reference(Reference),
    /// Literal JSON value.
    Literal(serde_json::Value),
}

impl PropertyValue {
    /// Returns the reference, if this value is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(r) => Some(r),
            Self::Literal(_) => None,
        }
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<Reference> for PropertyValue {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Logical identity.
    pub id: ResourceId,
    /// Desired properties.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit dependencies that carry no property reference.
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    /// Creates a resource with no properties.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: ResourceId) -> Self {
        self.depends_on.push(dependency);
        self
    }

    /// Iterates over the references held by this resource's properties.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.properties.values().filter_map(PropertyValue::as_reference)
    }

    /// Returns every resource this one depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        self.references()
            .map(|r| r.target.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }

    /// Resolves every property against applied outputs.
    ///
    /// # Errors
    ///
    /// Returns the first reference that has no value in `outputs`.
    pub fn resolve(
        &self,
        outputs: &BTreeMap<ResourceId, Properties>,
    ) -> std::result::Result<Properties, Reference> {
        let mut resolved = Properties::new();
        for (key, value) in &self.properties {
            let concrete = match value {
                PropertyValue::Literal(v) => v.clone(),
                PropertyValue::Reference(r) => r.lookup(outputs).cloned().ok_or_else(|| r.clone())?,
            };
            resolved.insert(key.clone(), concrete);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_parse() {
        let id: ResourceId = "bucket.my-test-bucket".parse().expect("valid id");
        assert_eq!(id.resource_type, "bucket");
        assert_eq!(id.name, "my-test-bucket");
        assert_eq!(id.to_string(), "bucket.my-test-bucket");

        assert!("bucket".parse::<ResourceId>().is_err());
        assert!(".name".parse::<ResourceId>().is_err());
        assert!("bucket.".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_property_value_untagged() {
        let reference: PropertyValue =
            serde_json::from_value(json!({ "$ref": "bucket.logs", "output": "arn" }))
                .expect("reference parses");
        assert_eq!(
            reference,
            PropertyValue::Reference(Reference::new(ResourceId::new("bucket", "logs"), "arn"))
        );

        let literal: PropertyValue =
            serde_json::from_value(json!({ "Environment": "dev" })).expect("literal parses");
        assert!(literal.as_reference().is_none());
    }

    #[test]
    fn test_resolve_uses_outputs() {
        let logs = ResourceId::new("bucket", "logs");
        let policy = Resource::new("policy", "read")
            .with_property("bucket_arn", Reference::new(logs.clone(), "arn"))
            .with_property("effect", json!("allow"));

        let mut outputs = BTreeMap::new();
        assert_eq!(
            policy.resolve(&outputs).expect_err("unresolved").output,
            "arn"
        );

        outputs.insert(logs, Properties::from([(String::from("arn"), json!("arn:x"))]));
        let resolved = policy.resolve(&outputs).expect("resolved");
        assert_eq!(resolved["bucket_arn"], json!("arn:x"));
        assert_eq!(resolved["effect"], json!("allow"));
    }
}
