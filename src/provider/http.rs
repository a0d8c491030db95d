//! HTTP provider implementation.
//!
//! Talks a small JSON protocol to a provider service:
//! `POST/PATCH/DELETE/GET {endpoint}/resources/{type}[/{id}]`.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{Created, PropertyDiff, Provider, ProviderResult};
use crate::config::ProviderConfig;
use crate::error::{ConfigError, HalldyllError, ProviderError, Result};
use crate::graph::Properties;

/// Provider backed by a JSON-over-HTTP service.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL; resource paths are appended segment by segment.
    endpoint: Url,
    /// Optional bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    properties: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Properties,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    changes: &'a PropertyDiff,
}

#[derive(Debug, Deserialize)]
struct OutputsResponse {
    #[serde(default)]
    outputs: Properties,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not a base URL or the HTTP client
    /// cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                HalldyllError::Config(ConfigError::validation(
                    format!("Invalid provider endpoint '{endpoint}'"),
                    "provider.endpoint",
                ))
            })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HalldyllError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Creates a provider from the stack's provider section.
    ///
    /// The bearer token is read from the variable named by `token_env`; a
    /// missing variable means unauthenticated requests.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or the client cannot be
    /// created.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            HalldyllError::Config(ConfigError::validation(
                "A provider endpoint is required",
                "provider.endpoint",
            ))
        })?;

        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            debug!("{} is not set; sending unauthenticated requests", config.token_env);
        }

        Self::new(endpoint, token, Duration::from_secs(config.timeout_secs))
    }

    /// Percent-encodes the type and id as single path segments.
    fn url(&self, resource_type: &str, provider_id: Option<&str>) -> ProviderResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::permanent(format!("{} cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .push("resources")
            .push(resource_type)
            .extend(provider_id);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<Response> {
        self.authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("Request failed: {e}")))
    }
}

/// Maps non-success statuses onto transient or permanent errors.
async fn check_status(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        return Err(ProviderError::Transient {
            message: String::from("Rate limited"),
            retry_after_secs,
        });
    }

    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::transient(format!("{status}: {body}")));
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::permanent(format!(
            "Authentication failed ({status})"
        )));
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::permanent(format!("{status}: {body}")))
}

async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
    response
        .json()
        .await
        .map_err(|e| ProviderError::permanent(format!("Invalid provider response: {e}")))
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, resource_type: &str, properties: &Properties) -> ProviderResult<Created> {
        let url = self.url(resource_type, None)?;
        trace!("POST {url}");

        let response = self
            .send(self.client.post(url).json(&CreateRequest { properties }))
            .await?;
        let body: CreateResponse = parse(check_status(response).await?).await?;

        Ok(Created {
            provider_id: body.id,
            outputs: body.outputs,
        })
    }

    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        diff: &PropertyDiff,
    ) -> ProviderResult<Properties> {
        let url = self.url(resource_type, Some(provider_id))?;
        trace!("PATCH {url}");

        let response = self
            .send(self.client.patch(url).json(&UpdateRequest { changes: diff }))
            .await?;
        let body: OutputsResponse = parse(check_status(response).await?).await?;

        Ok(body.outputs)
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        let url = self.url(resource_type, Some(provider_id))?;
        trace!("DELETE {url}");

        let response = self.send(self.client.delete(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{resource_type} {provider_id} already gone");
            return Ok(());
        }

        check_status(response).await.map(|_| ())
    }

    async fn read(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> ProviderResult<Option<Properties>> {
        let url = self.url(resource_type, Some(provider_id))?;
        trace!("GET {url}");

        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: OutputsResponse = parse(check_status(response).await?).await?;
        Ok(Some(body.outputs))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
