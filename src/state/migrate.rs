//! Snapshot decoding and forward migration.
//!
//! Every backend hands raw snapshot text to [`decode`], which checks the
//! version and upgrades older layouts before deserializing.

use serde_json::{Map, Value};
use tracing::info;

use crate::config::ConfigHasher;
use crate::error::{HalldyllError, Result, StateError};
use crate::graph::{Properties, ResourceId};

use super::types::{STATE_VERSION, StateSnapshot};

/// Parses snapshot text, migrating older versions forward.
///
/// # Errors
///
/// Returns [`StateError::Corrupted`] for unreadable snapshots and
/// [`StateError::VersionMismatch`] for versions newer than supported.
pub fn decode(content: &str) -> Result<StateSnapshot> {
    let mut value: Value = serde_json::from_str(content)
        .map_err(|e| corrupted(format!("Failed to parse state: {e}")))?;

    let version = value
        .get("version")
        .ok_or_else(|| corrupted("State has no version field"))?
        .as_u64()
        .ok_or_else(|| corrupted("State version is not an integer"))?;

    if version > u64::from(STATE_VERSION) {
        return Err(HalldyllError::State(StateError::VersionMismatch {
            expected: STATE_VERSION,
            found: version,
        }));
    }

    if version == 0 {
        return Err(corrupted("State version 0 is not valid"));
    }

    if version == 1 {
        info!("Migrating state from version 1 to {STATE_VERSION}");
        value = migrate_v1(value)?;
    }

    serde_json::from_value(value).map_err(|e| corrupted(format!("Failed to parse state: {e}")))
}

/// Serializes a snapshot the way every backend stores it.
///
/// # Errors
///
/// Returns a serialization error if the snapshot cannot be encoded.
pub fn encode(snapshot: &StateSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).map_err(|e| {
        HalldyllError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}

/// Version 1 kept resources as a list of `{urn, id, inputs, outputs}`.
fn migrate_v1(value: Value) -> Result<Value> {
    let Value::Object(mut root) = value else {
        return Err(corrupted("State root is not an object"));
    };

    let last_updated = root
        .get("last_updated")
        .cloned()
        .unwrap_or_else(|| Value::String(chrono::Utc::now().to_rfc3339()));

    let entries = match root.remove("resources") {
        Some(Value::Array(entries)) => entries,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(corrupted("Version 1 resources must be a list")),
    };

    let hasher = ConfigHasher::new();
    let mut resources = Map::new();

    for entry in entries {
        let urn = entry
            .get("urn")
            .and_then(Value::as_str)
            .ok_or_else(|| corrupted("Version 1 resource has no urn"))?;
        let id = identity_from_urn(urn)?;

        let provider_id = entry
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| corrupted(format!("Version 1 resource '{urn}' has no id")))?;

        let properties: Properties = field_map(&entry, "inputs")?;
        let outputs: Properties = field_map(&entry, "outputs")?;

        let record = serde_json::json!({
            "provider_id": provider_id,
            "properties_hash": hasher.hash_properties(&properties),
            "properties": properties,
            "outputs": outputs,
            "dependencies": [],
            "created_at": last_updated,
            "updated_at": last_updated,
        });
        resources.insert(id.to_string(), record);
    }

    root.insert(String::from("resources"), Value::Object(resources));
    root.insert(String::from("version"), Value::from(STATE_VERSION));
    root.insert(String::from("last_updated"), last_updated);

    Ok(Value::Object(root))
}

/// Accepts `type.name` or a urn ending in `::<type>::<name>`.
fn identity_from_urn(urn: &str) -> Result<ResourceId> {
    let parts: Vec<&str> = urn.split("::").collect();
    if let [.., resource_type, name] = parts.as_slice()
        && parts.len() > 2
        && !resource_type.is_empty()
        && !name.is_empty()
    {
        return Ok(ResourceId::new(*resource_type, *name));
    }

    urn.parse()
        .map_err(|e| corrupted(format!("Version 1 resource urn '{urn}' is invalid: {e}")))
}

fn field_map(entry: &Value, field: &str) -> Result<Properties> {
    match entry.get(field) {
        None | Some(Value::Null) => Ok(Properties::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| corrupted(format!("Version 1 '{field}' is not a map: {e}"))),
    }
}

fn corrupted(message: impl Into<String>) -> HalldyllError {
    HalldyllError::State(StateError::corrupted(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_version_round_trips() {
        let snapshot = StateSnapshot::new("demo", "dev");
        let text = encode(&snapshot).expect("encodes");
        assert_eq!(decode(&text).expect("decodes"), snapshot);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let text = json!({ "version": 99, "project": "demo", "environment": "dev" }).to_string();
        let err = decode(&text).expect_err("too new");
        assert!(matches!(
            err,
            HalldyllError::State(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: 99
            })
        ));
    }

    #[test]
    fn test_missing_or_bad_version_is_corruption() {
        for text in [
            json!({ "project": "demo" }).to_string(),
            json!({ "version": "1.0", "project": "demo" }).to_string(),
            String::from("{ not json"),
        ] {
            let err = decode(&text).expect_err("corrupt");
            assert!(matches!(
                err,
                HalldyllError::State(StateError::Corrupted { .. })
            ));
        }
    }

    #[test]
    fn test_migrates_version_one() {
        let text = json!({
            "version": 1,
            "project": "demo",
            "environment": "dev",
            "last_updated": "2024-05-01T10:00:00Z",
            "resources": [
                {
                    "urn": "urn:halldyll:demo::bucket::my-test-bucket",
                    "id": "bucket-1a2b3c4d",
                    "inputs": { "bucket": "my-test-bucket" },
                    "outputs": { "arn": "arn:halldyll:bucket:::bucket-1a2b3c4d" }
                },
                {
                    "urn": "policy.read",
                    "id": "policy-1",
                    "inputs": null
                }
            ]
        })
        .to_string();

        let snapshot = decode(&text).expect("migrates");
        assert_eq!(snapshot.version, STATE_VERSION);
        assert_eq!(snapshot.serial, 0);
        assert_eq!(snapshot.resources.len(), 2);

        let record = snapshot
            .get(&ResourceId::new("bucket", "my-test-bucket"))
            .expect("bucket migrated");
        assert_eq!(record.provider_id, "bucket-1a2b3c4d");
        assert_eq!(record.properties["bucket"], json!("my-test-bucket"));
        assert!(!record.properties_hash.is_empty());

        let policy = snapshot
            .get(&ResourceId::new("policy", "read"))
            .expect("policy migrated");
        assert!(policy.properties.is_empty());
    }

    #[test]
    fn test_version_one_without_urn_is_corruption() {
        let text = json!({
            "version": 1,
            "project": "demo",
            "environment": "dev",
            "resources": [{ "id": "x" }]
        })
        .to_string();
        assert!(decode(&text).is_err());
    }
}
