//! State types for tracking provisioned resources.
//!
//! These types represent the recorded state of a stack: what the provider
//! created, with which properties, and what it returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{Properties, ResourceId};

/// Current version of the state format.
pub const STATE_VERSION: u32 = 2;

/// Maximum number of history entries kept in a snapshot.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: u32,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied stack declaration.
    #[serde(default)]
    pub config_hash: String,
    /// Records keyed by logical identity.
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, StateRecord>,
    /// Resolved exports from the last apply.
    #[serde(default)]
    pub exports: BTreeMap<String, serde_json::Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// What is known about one provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Identity assigned by the provider.
    pub provider_id: String,
    /// Last applied, fully resolved properties.
    #[serde(default)]
    pub properties: Properties,
    /// Outputs returned by the provider.
    #[serde(default)]
    pub outputs: Properties,
    /// Dependencies as of the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Hash of `properties`.
    #[serde(default)]
    pub properties_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Stack hash at the time of the run.
    pub config_hash: String,
    /// Steps applied.
    pub applied: usize,
    /// Steps failed.
    pub failed: usize,
    /// Steps skipped.
    pub skipped: usize,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Plan applied against the provider.
    Apply,
    /// Every resource deleted.
    Destroy,
    /// Outputs re-read from the provider.
    Refresh,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.resources.get(id)
    }

    /// Adds or replaces a record.
    pub fn set(&mut self, id: ResourceId, record: StateRecord) {
        self.resources.insert(id, record);
        self.last_updated = Utc::now();
    }

    /// Removes a record.
    pub fn remove(&mut self, id: &ResourceId) -> Option<StateRecord> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Recorded outputs of every resource.
    #[must_use]
    pub fn outputs(&self) -> BTreeMap<ResourceId, Properties> {
        self.resources
            .iter()
            .map(|(id, record)| (id.clone(), record.outputs.clone()))
            .collect()
    }

    /// Records that recorded state depends on `id`.
    #[must_use]
    pub fn recorded_dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.resources
            .iter()
            .filter(|(_, record)| record.dependencies.contains(id))
            .map(|(dependent, _)| dependent)
            .collect()
    }

    /// Bumps the serial and timestamp ahead of a save.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest past the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl StateRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        properties: Properties,
        outputs: Properties,
        dependencies: BTreeSet<ResourceId>,
        properties_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            provider_id: provider_id.into(),
            properties,
            outputs,
            dependencies,
            properties_hash: properties_hash.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a copy with new properties and outputs, keeping the creation time.
    #[must_use]
    pub fn updated(
        &self,
        properties: Properties,
        outputs: Properties,
        dependencies: BTreeSet<ResourceId>,
        properties_hash: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: self.provider_id.clone(),
            properties,
            outputs,
            dependencies,
            properties_hash: properties_hash.into(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(operation: Operation, config_hash: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            applied: 0,
            failed: 0,
            skipped: 0,
            success: true,
            error: None,
        }
    }

    /// Sets the step counts.
    #[must_use]
    pub const fn with_counts(mut self, applied: usize, failed: usize, skipped: usize) -> Self {
        self.applied = applied;
        self.failed = failed;
        self.skipped = skipped;
        self.success = failed == 0 && skipped == 0;
        self
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket() -> ResourceId {
        ResourceId::new("bucket", "logs")
    }

    #[test]
    fn test_snapshot_json_keys_are_identities() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.set(
            bucket(),
            StateRecord::new(
                "bucket-1",
                Properties::from([(String::from("bucket"), json!("logs"))]),
                Properties::new(),
                BTreeSet::new(),
                "h",
            ),
        );

        let value = serde_json::to_value(&snapshot).expect("serializes");
        assert_eq!(value["version"], json!(2));
        assert_eq!(value["resources"]["bucket.logs"]["provider_id"], json!("bucket-1"));

        let back: StateSnapshot = serde_json::from_value(value).expect("deserializes");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_recorded_dependents() {
        let policy = ResourceId::new("policy", "read");
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.set(
            bucket(),
            StateRecord::new("b", Properties::new(), Properties::new(), BTreeSet::new(), ""),
        );
        snapshot.set(
            policy.clone(),
            StateRecord::new(
                "p",
                Properties::new(),
                Properties::new(),
                BTreeSet::from([bucket()]),
                "",
            ),
        );

        assert_eq!(snapshot.recorded_dependents(&bucket()), vec![&policy]);
        assert!(snapshot.recorded_dependents(&policy).is_empty());
    }

    #[test]
    fn test_touch_increments_serial() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        snapshot.touch();
        snapshot.touch();
        assert_eq!(snapshot.serial, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(HistoryEntry::new(Operation::Apply, "h"));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_history_counts() {
        let entry = HistoryEntry::new(Operation::Apply, "h").with_counts(2, 1, 1);
        assert!(!entry.success);
        let entry = HistoryEntry::new(Operation::Destroy, "h").with_counts(3, 0, 0);
        assert!(entry.success);
        assert_eq!(entry.operation.to_string(), "destroy");
    }
}
