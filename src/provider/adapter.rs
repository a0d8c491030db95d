//! Retrying wrapper around a [`Provider`].

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::{Created, PropertyDiff, Provider, ProviderResult};
use crate::graph::Properties;

/// A provider plus the retry policy applied to every call.
///
/// Cloning is cheap; the executor hands one clone to each step task.
#[derive(Clone)]
pub struct ProviderAdapter {
    /// The wrapped provider.
    provider: Arc<dyn Provider>,
    /// Retry policy for transient failures.
    retry: RetryPolicy,
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider", &self.provider.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl ProviderAdapter {
    /// Wraps a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Name of the wrapped provider.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.provider.name()
    }

    /// Creates a resource, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retries are exhausted, or the
    /// first permanent one.
    pub async fn create(&self, resource_type: &str, properties: &Properties) -> ProviderResult<Created> {
        self.with_retry("create", resource_type, || {
            self.provider.create(resource_type, properties)
        })
        .await
    }

    /// Updates a resource in place, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retries are exhausted, or the
    /// first permanent one.
    pub async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        diff: &PropertyDiff,
    ) -> ProviderResult<Properties> {
        self.with_retry("update", resource_type, || {
            self.provider.update(resource_type, provider_id, diff)
        })
        .await
    }

    /// Deletes a resource, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retries are exhausted, or the
    /// first permanent one.
    pub async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        self.with_retry("delete", resource_type, || {
            self.provider.delete(resource_type, provider_id)
        })
        .await
    }

    /// Reads current outputs, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last provider error once retries are exhausted, or the
    /// first permanent one.
    pub async fn read(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Properties>> {
        self.with_retry("read", resource_type, || {
            self.provider.read(resource_type, provider_id)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, resource_type: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.retry.allows_retry_after(attempt) => {
                    let delay = self.retry.delay_for(attempt, err.retry_after_secs());
                    warn!(
                        "{} {operation} {resource_type} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                        self.provider.name(),
                        self.retry.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(
                        "{} {operation} {resource_type} gave up after {attempt} attempt(s): {err}",
                        self.provider.name()
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::MockProvider;
    use mockall::Sequence;
    use serde_json::json;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn created() -> Created {
        Created {
            provider_id: String::from("bucket-1"),
            outputs: Properties::from([(String::from("arn"), json!("arn:x"))]),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let mut mock = MockProvider::new();
        let mut seq = Sequence::new();
        mock.expect_name().return_const("mock");
        mock.expect_create()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ProviderError::transient("throttled")));
        mock.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(created()));

        let adapter = ProviderAdapter::new(Arc::new(mock), fast_policy(3));
        let result = adapter.create("bucket", &Properties::new()).await;

        assert_eq!(result, Ok(created()));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_delete()
            .times(3)
            .returning(|_, _| Err(ProviderError::transient("503")));

        let adapter = ProviderAdapter::new(Arc::new(mock), fast_policy(3));
        let err = adapter.delete("bucket", "bucket-1").await.expect_err("exhausted");

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_update()
            .times(1)
            .returning(|_, _, _| Err(ProviderError::permanent("AccessDenied")));

        let adapter = ProviderAdapter::new(Arc::new(mock), fast_policy(5));
        let err = adapter
            .update("bucket", "bucket-1", &PropertyDiff::new())
            .await
            .expect_err("permanent");

        assert_eq!(err, ProviderError::permanent("AccessDenied"));
    }

    #[tokio::test]
    async fn test_read_passes_arguments_through() {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_read()
            .times(1)
            .returning(|resource_type, provider_id| {
                assert_eq!(resource_type, "bucket");
                assert_eq!(provider_id, "bucket-1");
                Ok(None)
            });

        let adapter = ProviderAdapter::new(Arc::new(mock), RetryPolicy::none());
        assert_eq!(adapter.read("bucket", "bucket-1").await, Ok(None));
        assert_eq!(adapter.name(), "mock");
    }
}
