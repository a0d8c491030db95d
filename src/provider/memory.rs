//! In-process provider.
//!
//! Keeps resources in memory and records every call. It backs local dry
//! runs and the engine's own tests, including failure injection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use super::{Created, PropertyDiff, Provider, ProviderResult, apply_diff};
use crate::error::ProviderError;
use crate::graph::Properties;

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Which operation was called.
    pub kind: CallKind,
    /// Resource type passed in.
    pub resource_type: String,
    /// Provider identity, for calls on existing resources.
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredResource {
    resource_type: String,
    properties: Properties,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, StoredResource>,
    calls: Vec<ProviderCall>,
    fail_on: Vec<(String, serde_json::Value)>,
    fail_delete: Vec<String>,
    transient_failures: u32,
}

/// In-memory provider with fault injection.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails create/update permanently when `key` would be set to `value`.
    pub fn fail_when(&self, key: impl Into<String>, value: serde_json::Value) {
        self.lock().fail_on.push((key.into(), value));
    }

    /// Fails every delete of `provider_id` permanently.
    pub fn fail_delete_of(&self, provider_id: impl Into<String>) {
        self.lock().fail_delete.push(provider_id.into());
    }

    /// Fails the next `times` calls with a transient error.
    pub fn fail_transiently(&self, times: u32) {
        self.lock().transient_failures = times;
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of calls of one kind.
    #[must_use]
    pub fn count(&self, kind: CallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Current outputs of a live resource.
    #[must_use]
    pub fn outputs_of(&self, provider_id: &str) -> Option<Properties> {
        self.lock()
            .resources
            .get(provider_id)
            .map(|r| outputs(&r.resource_type, provider_id, &r.properties))
    }

    /// Removes a resource behind the engine's back.
    pub fn remove_out_of_band(&self, provider_id: &str) {
        self.lock().resources.remove(provider_id);
    }

    /// Changes a property behind the engine's back.
    pub fn set_out_of_band(&self, provider_id: &str, key: &str, value: serde_json::Value) {
        if let Some(resource) = self.lock().resources.get_mut(provider_id) {
            resource.properties.insert(key.to_string(), value);
        }
    }

    /// Highest number of calls that were in progress at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn begin(&self, kind: CallKind, resource_type: &str, provider_id: Option<&str>) -> ProviderResult<InFlight<'_>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            kind,
            resource_type: resource_type.to_string(),
            provider_id: provider_id.map(str::to_string),
        });

        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(ProviderError::transient("injected transient failure"));
        }

        Ok(guard)
    }

    fn check_rules<'a>(
        inner: &Inner,
        mut values: impl Iterator<Item = (&'a String, &'a serde_json::Value)>,
    ) -> ProviderResult<()> {
        let hit = values.find(|(key, value)| {
            inner
                .fail_on
                .iter()
                .any(|(rule_key, rule_value)| rule_key == *key && rule_value == *value)
        });

        match hit {
            Some((key, value)) => Err(ProviderError::permanent(format!(
                "injected failure: {key} = {value}"
            ))),
            None => Ok(()),
        }
    }
}

/// Properties plus the computed `id` and `arn`.
fn outputs(resource_type: &str, provider_id: &str, properties: &Properties) -> Properties {
    let mut outputs = properties.clone();
    outputs.insert(String::from("id"), serde_json::Value::from(provider_id));
    outputs.insert(
        String::from("arn"),
        serde_json::Value::from(format!("arn:halldyll:{resource_type}:::{provider_id}")),
    );
    outputs
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create(&self, resource_type: &str, properties: &Properties) -> ProviderResult<Created> {
        let _guard = self.begin(CallKind::Create, resource_type, None).await?;
        let mut inner = self.lock();
        Self::check_rules(&inner, properties.iter())?;

        let provider_id = format!("{resource_type}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        trace!("memory: created {provider_id}");

        inner.resources.insert(
            provider_id.clone(),
            StoredResource {
                resource_type: resource_type.to_string(),
                properties: properties.clone(),
            },
        );

        Ok(Created {
            outputs: outputs(resource_type, &provider_id, properties),
            provider_id,
        })
    }

    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        diff: &PropertyDiff,
    ) -> ProviderResult<Properties> {
        let _guard = self
            .begin(CallKind::Update, resource_type, Some(provider_id))
            .await?;
        let mut inner = self.lock();
        Self::check_rules(
            &inner,
            diff.iter()
                .filter_map(|(key, change)| change.new.as_ref().map(|v| (key, v))),
        )?;

        let resource = inner
            .resources
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::permanent(format!("{provider_id} does not exist")))?;
        apply_diff(&mut resource.properties, diff);

        Ok(outputs(resource_type, provider_id, &resource.properties))
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        let _guard = self
            .begin(CallKind::Delete, resource_type, Some(provider_id))
            .await?;
        let mut inner = self.lock();
        if inner.fail_delete.iter().any(|id| id == provider_id) {
            return Err(ProviderError::permanent(format!(
                "injected failure: delete {provider_id}"
            )));
        }
        inner.resources.remove(provider_id);
        Ok(())
    }

    async fn read(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Properties>> {
        let _guard = self
            .begin(CallKind::Read, resource_type, Some(provider_id))
            .await?;
        Ok(self
            .lock()
            .resources
            .get(provider_id)
            .map(|r| outputs(&r.resource_type, provider_id, &r.properties)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
