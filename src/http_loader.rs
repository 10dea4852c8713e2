//! HTTP loader for fetching original images from remote origins

use crate::config::HttpLoaderConfig;
use crate::context::RequestContext;
use crate::error::{PartialError, RelayError, Result};
use crate::loader::Loader;
use crate::models::USER_AGENT;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Loader that fetches identifiers over HTTP(S)
///
/// Absolute `http://` and `https://` identifiers are fetched as-is when
/// allowed. Other identifiers are resolved against `base_url` when one is
/// configured and passed to the next loader otherwise.
#[derive(Clone)]
pub struct HttpLoader {
    http_client: Client,
    base_url: Option<String>,
    allow_absolute: bool,
}

impl HttpLoader {
    /// Create a new HttpLoader
    ///
    /// # Arguments
    /// * `base_url` - Origin relative identifiers are resolved against
    /// * `timeout` - Upper bound for a single fetch, zero for none
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpLoader {
            http_client,
            base_url: base_url.map(|b| b.trim_end_matches('/').to_string()),
            allow_absolute: true,
        })
    }

    pub fn from_config(config: &HttpLoaderConfig) -> Result<Self> {
        let mut loader = Self::new(config.base_url.clone(), Duration::from_millis(config.timeout_ms))?;
        loader.allow_absolute = config.allow_absolute;
        Ok(loader)
    }

    /// Only fetch relative identifiers against the base URL
    pub fn relative_only(mut self) -> Self {
        self.allow_absolute = false;
        self
    }

    /// Map an identifier to the URL to fetch, if this loader handles it
    pub fn url_for(&self, image: &str) -> Option<String> {
        if image.starts_with("http://") || image.starts_with("https://") {
            return self.allow_absolute.then(|| image.to_string());
        }
        self.base_url
            .as_ref()
            .map(|base| format!("{}/{}", base, image.trim_start_matches('/')))
    }

    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, PartialError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;

        if status.is_success() {
            return Ok(body);
        }

        debug!(url = %url, status = status.as_u16(), "origin returned error status");
        let message = status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
        Err(PartialError::new(
            RelayError::from_http_status(status.as_u16(), message),
            body,
        ))
    }
}

fn transport_error(e: reqwest::Error) -> PartialError {
    if e.is_timeout() {
        RelayError::Timeout.into()
    } else {
        RelayError::InternalError(format!("Request failed: {}", e)).into()
    }
}

#[async_trait]
impl Loader for HttpLoader {
    async fn load(&self, ctx: &RequestContext, image: &str) -> std::result::Result<Bytes, PartialError> {
        let url = self.url_for(image).ok_or(RelayError::Pass)?;
        debug!(image = %image, url = %url, "fetching");
        ctx.run(self.fetch(&url)).await?
    }
}
