//! Processor trait and the processor fallback chain

use crate::context::RequestContext;
use crate::error::{PartialError, RelayError, Result};
use crate::models::{Meta, Params};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};

/// Result of a successful processing stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Processed {
    pub buf: Bytes,
    pub meta: Option<Meta>,
}

/// Callback processors use to fetch auxiliary images (watermarks, overlays)
///
/// Loads go through the same deduplicated, cached path as the main image.
#[async_trait]
pub trait LoadFunc: Send + Sync {
    async fn load(&self, image: &str) -> std::result::Result<Bytes, PartialError>;
}

/// Image transformation stage
#[async_trait]
pub trait Processor: Send + Sync {
    /// Called once before the server accepts requests
    async fn startup(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// Transform `buf` according to `params`
    ///
    /// Returning `Pass` hands the request to the next stage; bytes carried
    /// with it replace the input for that stage.
    async fn process(
        &self,
        ctx: &RequestContext,
        buf: Bytes,
        params: &Params,
        load: &dyn LoadFunc,
    ) -> std::result::Result<Processed, PartialError>;

    /// Called once after the server stops accepting requests
    async fn shutdown(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }
}

/// Run processors in order until one succeeds
///
/// # Returns
/// The first successful stage's output. With no processors, the input
/// unchanged and no metadata. When no stage succeeds, the last error other
/// than `Pass` (or `Pass` if that is all there was) with the current buffer.
pub async fn process_chain(
    ctx: &RequestContext,
    processors: &[Arc<dyn Processor>],
    buf: Bytes,
    params: &Params,
    load: &dyn LoadFunc,
) -> std::result::Result<Processed, PartialError> {
    if processors.is_empty() {
        return Ok(Processed { buf, meta: None });
    }

    let mut current = buf;
    let mut last: Option<RelayError> = None;

    for (idx, processor) in processors.iter().enumerate() {
        match processor.process(ctx, current.clone(), params, load).await {
            Ok(processed) => {
                debug!(
                    image = %params.image,
                    processor = idx,
                    size = processed.buf.len(),
                    "processed"
                );
                return Ok(processed);
            }
            Err(PartialError {
                error: RelayError::Pass,
                buf,
            }) => {
                if !buf.is_empty() {
                    current = buf;
                }
                debug!(image = %params.image, processor = idx, "processor passed");
            }
            Err(PartialError { error, .. }) => {
                if error.is_cancellation() {
                    debug!(image = %params.image, processor = idx, error = %error, "processing interrupted");
                } else {
                    error!(
                        image = %params.image,
                        path = %params.path,
                        processor = idx,
                        error = %error,
                        "processor failed"
                    );
                }
                last = Some(error);
            }
        }
    }

    Err(PartialError::new(last.unwrap_or(RelayError::Pass), current))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLoad;

    #[async_trait]
    impl LoadFunc for NoLoad {
        async fn load(&self, _image: &str) -> std::result::Result<Bytes, PartialError> {
            Err(RelayError::NotFound.into())
        }
    }

    struct Stage(std::result::Result<Processed, PartialError>);

    #[async_trait]
    impl Processor for Stage {
        async fn process(
            &self,
            _ctx: &RequestContext,
            _buf: Bytes,
            _params: &Params,
            _load: &dyn LoadFunc,
        ) -> std::result::Result<Processed, PartialError> {
            self.0.clone()
        }
    }

    /// Echoes whatever it was given.
    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn process(
            &self,
            _ctx: &RequestContext,
            buf: Bytes,
            _params: &Params,
            _load: &dyn LoadFunc,
        ) -> std::result::Result<Processed, PartialError> {
            Ok(Processed { buf, meta: None })
        }
    }

    #[tokio::test]
    async fn test_empty_chain_returns_input() {
        let out = process_chain(
            &RequestContext::new(),
            &[],
            Bytes::from_static(b"raw"),
            &Params::default(),
            &NoLoad,
        )
        .await
        .unwrap();
        assert_eq!(out.buf, Bytes::from_static(b"raw"));
        assert!(out.meta.is_none());
    }

    #[tokio::test]
    async fn test_pass_bytes_feed_next_stage() {
        let processors: Vec<Arc<dyn Processor>> = vec![
            Arc::new(Stage(Err(PartialError::pass_with(Bytes::from_static(b"normalized"))))),
            Arc::new(Echo),
        ];
        let out = process_chain(
            &RequestContext::new(),
            &processors,
            Bytes::from_static(b"raw"),
            &Params::default(),
            &NoLoad,
        )
        .await
        .unwrap();
        assert_eq!(out.buf, Bytes::from_static(b"normalized"));
    }

    #[tokio::test]
    async fn test_last_hard_error_wins_over_pass() {
        let processors: Vec<Arc<dyn Processor>> = vec![
            Arc::new(Stage(Err(RelayError::UnsupportedFormat("tiff".into()).into()))),
            Arc::new(Stage(Err(RelayError::Pass.into()))),
        ];
        let err = process_chain(
            &RequestContext::new(),
            &processors,
            Bytes::from_static(b"raw"),
            &Params::default(),
            &NoLoad,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error, RelayError::UnsupportedFormat("tiff".into()));
        assert_eq!(err.buf, Bytes::from_static(b"raw"));
    }

    #[tokio::test]
    async fn test_all_pass_returns_pass() {
        let processors: Vec<Arc<dyn Processor>> =
            vec![Arc::new(Stage(Err(RelayError::Pass.into())))];
        let err = process_chain(
            &RequestContext::new(),
            &processors,
            Bytes::from_static(b"raw"),
            &Params::default(),
            &NoLoad,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error, RelayError::Pass);
    }
}
