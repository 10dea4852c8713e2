//! Loader and storage traits, and the loader fallback chain
//!
//! Loaders are tried in configured order until one succeeds. A loader that
//! does not handle an identifier returns [`RelayError::Pass`]; any loader may
//! return bytes alongside its error, which the chain keeps as a fallback body.

use crate::context::RequestContext;
use crate::error::{PartialError, RelayError, Result};
use crate::metrics::RelayMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};

/// Source of original image bytes
#[async_trait]
pub trait Loader: Send + Sync {
    /// Fetch the bytes for `image`
    ///
    /// # Returns
    /// * `Ok(Bytes)` on success
    /// * `Err(PartialError)` with `Pass` when the identifier is not handled here,
    ///   or any other error; `buf` may carry a usable partial body
    async fn load(&self, ctx: &RequestContext, image: &str) -> std::result::Result<Bytes, PartialError>;
}

/// Destination for successfully loaded bytes
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, ctx: &RequestContext, image: &str, buf: &Bytes) -> Result<()>;
}

/// Try each loader in order, returning the first success
///
/// # Arguments
/// * `ctx` - Context handed to each loader
/// * `loaders` - Loaders in configured order
/// * `image` - Image identifier
/// * `metrics` - Optional collector for hard loader failures
///
/// # Returns
/// The first successful body. When every loader fails, the last error with
/// the most recent non-empty fallback body; a trailing `Pass` is reported as
/// `NotFound`, as is an empty loader list.
pub async fn load_chain(
    ctx: &RequestContext,
    loaders: &[Arc<dyn Loader>],
    image: &str,
    metrics: Option<&RelayMetrics>,
) -> std::result::Result<Bytes, PartialError> {
    let mut fallback = Bytes::new();
    let mut last = RelayError::NotFound;

    for (idx, loader) in loaders.iter().enumerate() {
        match loader.load(ctx, image).await {
            Ok(buf) => {
                debug!(image = %image, loader = idx, size = buf.len(), "loaded");
                return Ok(buf);
            }
            Err(PartialError { error, buf }) => {
                if !buf.is_empty() {
                    fallback = buf;
                }
                match error {
                    RelayError::Pass | RelayError::NotFound => {
                        debug!(image = %image, loader = idx, error = %error, "loader skipped");
                    }
                    ref e if e.is_cancellation() => {
                        debug!(image = %image, loader = idx, error = %e, "load interrupted");
                    }
                    ref e => {
                        error!(image = %image, loader = idx, error = %e, "loader failed");
                        if let Some(metrics) = metrics {
                            metrics.record_loader_failure(e.kind());
                        }
                    }
                }
                last = error;
            }
        }
    }

    Err(PartialError::new(last.into_visible(), fallback))
}
