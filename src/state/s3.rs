//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for shared stacks. A single `PutObject` replaces the snapshot
//! as a whole, so readers never observe a partial write.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::error::{HalldyllError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::migrate;
use super::store::StateStore;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

impl S3StateStore {
    /// Creates a store using the default AWS credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the AWS configuration cannot be loaded.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;

        Ok(Self::with_client(Client::new(&sdk_config), bucket, prefix))
    }

    /// Creates a store around an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Reads `file` under the prefix; a missing key is `None`.
    async fn fetch(&self, file: &str) -> Result<Option<String>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let e = e.into_service_error();
                return if e.is_no_such_key() { Ok(None) } else { Err(s3_error("get", file, &e)) };
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| s3_error("read", file, &e))?
            .into_bytes();
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| HalldyllError::State(StateError::corrupted(format!("{file} is not UTF-8: {e}"))))
    }

    async fn store(&self, file: &str, json: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .content_type("application/json")
            .body(ByteStream::from(json.into_bytes()))
            .send()
            .await
            .map(drop)
            .map_err(|e| s3_error("put", file, &e))
    }

    async fn remove(&self, file: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .send()
            .await
            .map(drop)
            .map_err(|e| s3_error("delete", file, &e))
    }
}

fn s3_error(action: &str, file: &str, e: &impl std::fmt::Display) -> HalldyllError {
    HalldyllError::State(StateError::s3(format!("{action} {file}: {e}")))
}

/// Trims slashes and appends one, so keys join cleanly.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        debug!("Reading s3://{}/{}", self.bucket, self.key(STATE_KEY));
        let Some(json) = self.fetch(STATE_KEY).await? else {
            return Ok(None);
        };

        let state = migrate::decode(&json)?;
        debug!("Loaded {}/{} at serial {}", state.project, state.environment, state.serial);
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.store(STATE_KEY, migrate::encode(state)?).await?;
        debug!("Saved serial {} to s3://{}/{}", state.serial, self.bucket, self.key(STATE_KEY));
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("Removing state under s3://{}/{}", self.bucket, self.prefix);
        self.remove(STATE_KEY).await?;
        self.remove(LOCK_KEY).await
    }

    async fn exists(&self) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = e.into_service_error();
                if e.is_not_found() { Ok(false) } else { Err(s3_error("head", STATE_KEY, &e)) }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info().await? {
            existing.ensure_expired()?;
            debug!("Taking over expired lock {}", existing.lock_id);
        }

        let lock = LockInfo::new(&holder_or_generated(holder));
        self.store(LOCK_KEY, lock.encode()?).await?;
        info!("Locked s3 state as {} for {LOCK_EXPIRY_SECS}s", lock.holder);
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.get_lock_info().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.remove(LOCK_KEY).await?;
                info!("Released state lock {lock_id}");
            }
            Some(existing) => debug!("Not releasing {lock_id}; lock belongs to {}", existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.fetch(LOCK_KEY)
            .await?
            .map(|content| LockInfo::decode(&content))
            .transpose()
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("my-stack/dev")), "my-stack/dev/");
        assert_eq!(normalize_prefix(Some("/my-stack/dev/")), "my-stack/dev/");
    }
}
