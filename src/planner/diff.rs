//! Diff engine for comparing the desired graph against recorded state.
//!
//! Resources are compared in topological order so that a reference can be
//! judged by what is already known about its target: if the target is not
//! changing, the reference resolves against recorded outputs; otherwise its
//! value is only known after apply.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::config::{ConfigHasher, EngineConfig};
use crate::graph::{Properties, PropertyValue, Reference, Resource, ResourceGraph, ResourceId};
use crate::state::{StateRecord, StateSnapshot};

/// Properties that cannot change in place, per resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementPolicy {
    immutable: HashMap<String, BTreeSet<String>>,
}

impl ReplacementPolicy {
    /// Creates an empty policy: every change is an in-place update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `property` of `resource_type` as requiring replacement.
    #[must_use]
    pub fn with(mut self, resource_type: impl Into<String>, property: impl Into<String>) -> Self {
        self.immutable
            .entry(resource_type.into())
            .or_default()
            .insert(property.into());
        self
    }

    /// Builds the policy from `engine.replace_on_change`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let immutable = config
            .replace_on_change
            .iter()
            .map(|(resource_type, props)| (resource_type.clone(), props.iter().cloned().collect()))
            .collect();
        Self { immutable }
    }

    /// Returns true if changing `property` forces a replacement.
    #[must_use]
    pub fn requires_replacement(&self, resource_type: &str, property: &str) -> bool {
        self.immutable
            .get(resource_type)
            .is_some_and(|props| props.contains(property))
    }
}

/// Engine for computing diffs between the desired graph and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Replacement policy.
    policy: ReplacementPolicy,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Per-attribute changes.
    pub details: Vec<DiffDetail>,
    /// Provider identity from state, if recorded.
    pub provider_id: Option<String>,
    /// Recorded properties hash.
    pub old_hash: Option<String>,
    /// Desired properties hash, when every value is known.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource is no longer declared.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// The desired side of an attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NewValue {
    /// Known now.
    Known(serde_json::Value),
    /// Known only after the referenced resource is applied.
    Unknown(Reference),
    /// Attribute no longer declared.
    Removed,
}

/// Detail about a specific attribute difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// Attribute that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<serde_json::Value>,
    /// Desired value.
    pub new_value: NewValue,
    /// Whether this change cannot be applied in place.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// Declared resources in topological order, then removed ones.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a diff engine with an empty replacement policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replacement policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ReplacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Computes the diff between the desired graph and recorded state.
    #[must_use]
    pub fn compute_diff(&self, graph: &ResourceGraph, state: Option<&StateSnapshot>) -> DiffResult {
        let empty = BTreeMap::new();
        let records = state.map_or(&empty, |s| &s.resources);

        let mut diffs = Vec::with_capacity(graph.len());
        let mut pending: HashSet<&ResourceId> = HashSet::new();

        for resource in graph.iter() {
            let diff = match records.get(&resource.id) {
                None => self.create_diff(resource, records, &pending),
                Some(record) => self.existing_diff(resource, record, records, &pending),
            };

            if diff.diff_type != DiffType::NoChange {
                pending.insert(&resource.id);
            }
            debug!("{}: {:?}", resource.id, diff.diff_type);
            diffs.push(diff);
        }

        for (id, record) in records {
            if !graph.contains(id) {
                debug!("{id} is no longer declared");
                diffs.push(Self::delete_diff(id, record));
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    fn create_diff(
        &self,
        resource: &Resource,
        records: &BTreeMap<ResourceId, StateRecord>,
        pending: &HashSet<&ResourceId>,
    ) -> ResourceDiff {
        let details = resource
            .properties
            .iter()
            .map(|(field, value)| DiffDetail {
                field: field.clone(),
                old_value: None,
                new_value: desired_value(value, records, pending),
                forces_replacement: false,
            })
            .collect::<Vec<_>>();

        ResourceDiff {
            id: resource.id.clone(),
            diff_type: DiffType::Create,
            new_hash: self.known_hash(&details),
            details,
            provider_id: None,
            old_hash: None,
        }
    }

    fn existing_diff(
        &self,
        resource: &Resource,
        record: &StateRecord,
        records: &BTreeMap<ResourceId, StateRecord>,
        pending: &HashSet<&ResourceId>,
    ) -> ResourceDiff {
        let resource_type = resource.id.resource_type.as_str();
        let mut details = Vec::new();
        let mut desired = Vec::new();

        for (field, value) in &resource.properties {
            let new_value = desired_value(value, records, pending);
            let old_value = record.properties.get(field);

            let unchanged = matches!(&new_value, NewValue::Known(v) if Some(v) == old_value);
            if !unchanged {
                details.push(DiffDetail {
                    field: field.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.clone(),
                    forces_replacement: self.policy.requires_replacement(resource_type, field),
                });
            }
            desired.push(DiffDetail {
                field: field.clone(),
                old_value: None,
                new_value,
                forces_replacement: false,
            });
        }

        for (field, old_value) in &record.properties {
            if !resource.properties.contains_key(field) {
                details.push(DiffDetail {
                    field: field.clone(),
                    old_value: Some(old_value.clone()),
                    new_value: NewValue::Removed,
                    forces_replacement: self.policy.requires_replacement(resource_type, field),
                });
            }
        }

        let diff_type = if details.is_empty() {
            DiffType::NoChange
        } else if details.iter().any(|d| d.forces_replacement) {
            DiffType::Replace
        } else {
            DiffType::Update
        };

        ResourceDiff {
            id: resource.id.clone(),
            diff_type,
            details,
            provider_id: Some(record.provider_id.clone()),
            old_hash: Some(record.properties_hash.clone()),
            new_hash: self.known_hash(&desired),
        }
    }

    fn delete_diff(id: &ResourceId, record: &StateRecord) -> ResourceDiff {
        let details = record
            .properties
            .iter()
            .map(|(field, value)| DiffDetail {
                field: field.clone(),
                old_value: Some(value.clone()),
                new_value: NewValue::Removed,
                forces_replacement: false,
            })
            .collect();

        ResourceDiff {
            id: id.clone(),
            diff_type: DiffType::Delete,
            details,
            provider_id: Some(record.provider_id.clone()),
            old_hash: Some(record.properties_hash.clone()),
            new_hash: None,
        }
    }

    /// Hash of the desired properties, if none is unknown.
    fn known_hash(&self, desired: &[DiffDetail]) -> Option<String> {
        let mut known = Properties::new();
        for detail in desired {
            match &detail.new_value {
                NewValue::Known(value) => {
                    known.insert(detail.field.clone(), value.clone());
                }
                NewValue::Unknown(_) => return None,
                NewValue::Removed => {}
            }
        }
        Some(self.hasher.hash_properties(&known))
    }
}

/// What a declared value will be, as far as can be told before applying.
fn desired_value(
    value: &PropertyValue,
    records: &BTreeMap<ResourceId, StateRecord>,
    pending: &HashSet<&ResourceId>,
) -> NewValue {
    match value {
        PropertyValue::Literal(v) => NewValue::Known(v.clone()),
        PropertyValue::Reference(r) if pending.contains(&r.target) => NewValue::Unknown(r.clone()),
        PropertyValue::Reference(r) => records
            .get(&r.target)
            .and_then(|record| record.outputs.get(&r.output))
            .map_or_else(|| NewValue::Unknown(r.clone()), |v| NewValue::Known(v.clone())),
    }
}

impl DiffResult {
    /// Returns true if anything would change.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.replaces + self.deletes > 0
    }

    /// Returns the diff for one resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.id == id)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for NewValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown(reference) => write!(f, "(known after apply: {reference})"),
            Self::Removed => write!(f, "(removed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn bucket() -> ResourceId {
        ResourceId::new("bucket", "logs")
    }

    fn policy_id() -> ResourceId {
        ResourceId::new("policy", "read")
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn graph(acl: &str) -> ResourceGraph {
        GraphBuilder::new()
            .resource(
                Resource::new("bucket", "logs")
                    .with_property("bucket", json!("logs"))
                    .with_property("acl", json!(acl)),
            )
            .resource(
                Resource::new("policy", "read")
                    .with_property("resource", Reference::new(bucket(), "arn")),
            )
            .build()
            .expect("graph")
    }

    fn applied_state(acl: &str) -> StateSnapshot {
        let mut state = StateSnapshot::new("demo", "dev");
        let bucket_props = props(&[("bucket", json!("logs")), ("acl", json!(acl))]);
        let mut bucket_outputs = bucket_props.clone();
        bucket_outputs.insert(String::from("arn"), json!("arn:bucket-1"));
        state.set(
            bucket(),
            StateRecord::new("bucket-1", bucket_props, bucket_outputs, BTreeSet::new(), "h1"),
        );
        state.set(
            policy_id(),
            StateRecord::new(
                "policy-1",
                props(&[("resource", json!("arn:bucket-1"))]),
                Properties::new(),
                BTreeSet::from([bucket()]),
                "h2",
            ),
        );
        state
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let diff = DiffEngine::new().compute_diff(&graph("private"), None);

        assert_eq!(diff.creates, 2);
        assert!(diff.has_changes());

        let policy = diff.get(&policy_id()).expect("policy diff");
        assert_eq!(
            policy.details[0].new_value,
            NewValue::Unknown(Reference::new(bucket(), "arn"))
        );
        assert!(policy.new_hash.is_none());
        assert!(diff.get(&bucket()).and_then(|d| d.new_hash.as_ref()).is_some());
    }

    #[test]
    fn test_matching_state_is_no_change() {
        let state = applied_state("private");
        let diff = DiffEngine::new().compute_diff(&graph("private"), Some(&state));

        assert_eq!(diff.unchanged, 2);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_changed_literal_updates_and_marks_dependents_unknown() {
        let state = applied_state("private");
        let diff = DiffEngine::new().compute_diff(&graph("public-read"), Some(&state));

        let bucket_diff = diff.get(&bucket()).expect("bucket");
        assert_eq!(bucket_diff.diff_type, DiffType::Update);
        assert_eq!(bucket_diff.details.len(), 1);
        assert_eq!(bucket_diff.details[0].field, "acl");
        assert_eq!(bucket_diff.provider_id.as_deref(), Some("bucket-1"));

        let policy = diff.get(&policy_id()).expect("policy");
        assert_eq!(policy.diff_type, DiffType::Update);
    }

    #[test]
    fn test_immutable_property_forces_replace() {
        let state = applied_state("private");
        let engine = DiffEngine::new().with_policy(ReplacementPolicy::new().with("bucket", "acl"));
        let diff = engine.compute_diff(&graph("public-read"), Some(&state));

        assert_eq!(diff.replaces, 1);
        assert_eq!(diff.get(&bucket()).map(|d| d.diff_type), Some(DiffType::Replace));
    }

    #[test]
    fn test_removed_attribute_is_a_change() {
        let mut state = applied_state("private");
        if let Some(record) = state.resources.get_mut(&bucket()) {
            record.properties.insert(String::from("versioning"), json!(true));
        }
        let diff = DiffEngine::new().compute_diff(&graph("private"), Some(&state));

        let bucket_diff = diff.get(&bucket()).expect("bucket");
        assert_eq!(bucket_diff.diff_type, DiffType::Update);
        assert_eq!(bucket_diff.details[0].new_value, NewValue::Removed);
    }

    #[test]
    fn test_undeclared_record_is_deleted() {
        let state = applied_state("private");
        let graph = GraphBuilder::new()
            .resource(Resource::new("bucket", "logs").with_property("bucket", json!("logs")).with_property("acl", json!("private")))
            .build()
            .expect("graph");

        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        assert_eq!(diff.deletes, 1);

        let last = diff.diffs.last().expect("delete diff");
        assert_eq!(last.id, policy_id());
        assert_eq!(last.diff_type, DiffType::Delete);
        assert_eq!(last.provider_id.as_deref(), Some("policy-1"));
    }

    #[test]
    fn test_missing_recorded_output_is_unknown() {
        let mut state = applied_state("private");
        if let Some(record) = state.resources.get_mut(&bucket()) {
            record.outputs.remove("arn");
        }
        let diff = DiffEngine::new().compute_diff(&graph("private"), Some(&state));

        assert_eq!(diff.get(&bucket()).map(|d| d.diff_type), Some(DiffType::NoChange));
        assert_eq!(diff.get(&policy_id()).map(|d| d.diff_type), Some(DiffType::Update));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = EngineConfig::default();
        config
            .replace_on_change
            .insert(String::from("bucket"), vec![String::from("bucket")]);

        let policy = ReplacementPolicy::from_config(&config);
        assert!(policy.requires_replacement("bucket", "bucket"));
        assert!(!policy.requires_replacement("bucket", "acl"));
        assert!(!policy.requires_replacement("policy", "bucket"));
    }
}
