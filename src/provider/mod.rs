//! Provider adapter contract.
//!
//! A [`Provider`] performs the actual create/read/update/delete calls against
//! an infrastructure API. The engine never talks to a provider directly: it
//! goes through a [`ProviderAdapter`], which adds bounded retries.

mod adapter;
mod http;
mod memory;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::graph::Properties;

pub use adapter::ProviderAdapter;
pub use http::HttpProvider;
pub use memory::{CallKind, MemoryProvider, ProviderCall};
pub use retry::RetryPolicy;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// What a provider returns after creating a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    /// Identity assigned by the provider.
    pub provider_id: String,
    /// Computed outputs (ids, ARNs, endpoints...).
    pub outputs: Properties,
}

/// A single attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Previous value, if the attribute existed.
    pub old: Option<serde_json::Value>,
    /// New value, if the attribute is kept.
    pub new: Option<serde_json::Value>,
}

/// Concrete attribute changes, keyed by attribute name.
pub type PropertyDiff = BTreeMap<String, PropertyChange>;

/// Operations a provider must support.
///
/// Implementations should make each call idempotent on retry where the
/// underlying API allows it. `delete` of an already-missing resource is Ok.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns its provider identity and outputs.
    async fn create(&self, resource_type: &str, properties: &Properties)
    -> ProviderResult<Created>;

    /// Applies a property diff in place and returns the new outputs.
    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        diff: &PropertyDiff,
    ) -> ProviderResult<Properties>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()>;

    /// Reads current outputs, or `None` if the resource no longer exists.
    async fn read(&self, resource_type: &str, provider_id: &str)
    -> ProviderResult<Option<Properties>>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

impl PropertyChange {
    /// Returns true if the attribute is being removed.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.new.is_none()
    }
}

/// Computes the concrete diff between two property sets.
#[must_use]
pub fn diff_properties(old: &Properties, new: &Properties) -> PropertyDiff {
    let mut diff = PropertyDiff::new();

    for (key, value) in new {
        if old.get(key) != Some(value) {
            diff.insert(
                key.clone(),
                PropertyChange {
                    old: old.get(key).cloned(),
                    new: Some(value.clone()),
                },
            );
        }
    }

    for (key, value) in old {
        if !new.contains_key(key) {
            diff.insert(
                key.clone(),
                PropertyChange {
                    old: Some(value.clone()),
                    new: None,
                },
            );
        }
    }

    diff
}

/// Applies a diff to a property set.
pub fn apply_diff(properties: &mut Properties, diff: &PropertyDiff) {
    for (key, change) in diff {
        match &change.new {
            Some(value) => {
                properties.insert(key.clone(), value.clone());
            }
            None => {
                properties.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_and_apply() {
        let old = Properties::from([
            (String::from("acl"), json!("private")),
            (String::from("legacy"), json!(true)),
            (String::from("bucket"), json!("logs")),
        ]);
        let new = Properties::from([
            (String::from("acl"), json!("public-read")),
            (String::from("bucket"), json!("logs")),
            (String::from("tags"), json!({ "team": "data" })),
        ]);

        let diff = diff_properties(&old, &new);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["acl"].old, Some(json!("private")));
        assert!(diff["legacy"].is_removal());
        assert_eq!(diff["tags"].old, None);
        assert!(!diff.contains_key("bucket"));

        let mut patched = old;
        apply_diff(&mut patched, &diff);
        assert_eq!(patched, new);
    }

    #[test]
    fn test_identical_properties_have_empty_diff() {
        let props = Properties::from([(String::from("acl"), json!("private"))]);
        assert!(diff_properties(&props, &props).is_empty());
    }
}
