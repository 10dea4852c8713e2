//! Request orchestration
//!
//! [`RelayProxy`] ties together authorization, the deduplicated loader chain,
//! background persistence and the processor chain. It is built once at
//! startup and shared by every connection.

use crate::cache::DedupCache;
use crate::config::RelayConfig;
use crate::context::RequestContext;
use crate::error::{PartialError, RelayError, Result};
use crate::file_store::FileStore;
use crate::http_loader::HttpLoader;
use crate::loader::{load_chain, Loader, Storage};
use crate::metrics::RelayMetrics;
use crate::models::{Meta, Params};
use crate::persist::persist;
use crate::processor::{process_chain, LoadFunc, Processor};
use crate::signature::SignatureAlgorithm;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Final result of handling one request
///
/// `buf` may be non-empty even when `err` is set; it is then a fallback body
/// to send with the error status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub buf: Bytes,
    pub meta: Option<Meta>,
    pub err: Option<RelayError>,
}

impl Outcome {
    fn failed(err: PartialError) -> Self {
        Outcome {
            buf: err.buf,
            meta: None,
            err: Some(err.error),
        }
    }
}

/// Main orchestrator shared by all requests
pub struct RelayProxy {
    unsafe_mode: bool,
    secret: String,
    signature_algorithm: SignatureAlgorithm,
    request_timeout: Duration,
    save_timeout: Duration,
    result_ttl: Duration,
    error_ttl: Duration,
    debug: bool,

    loaders: Vec<Arc<dyn Loader>>,
    storages: Vec<Arc<dyn Storage>>,
    processors: Vec<Arc<dyn Processor>>,
    cache: DedupCache,
    metrics: Option<RelayMetrics>,
}

impl RelayProxy {
    /// Create a proxy with the configured policy and no backends
    ///
    /// The cache is sized from `config.cache`; use the `with_*` methods to
    /// add loaders, storages and processors.
    pub fn new(config: &RelayConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: &RelayConfig, metrics: Option<RelayMetrics>) -> Self {
        let mut cache = DedupCache::from_config(&config.cache);
        if let Some(ref metrics) = metrics {
            cache = cache.with_metrics(metrics.clone());
        }
        RelayProxy {
            unsafe_mode: config.unsafe_mode,
            secret: config.secret.clone(),
            signature_algorithm: config.signature_algorithm,
            request_timeout: config.request_timeout(),
            save_timeout: config.save_timeout(),
            result_ttl: config.cache.result_ttl(),
            error_ttl: config.cache.error_ttl(),
            debug: config.debug,
            loaders: Vec::new(),
            storages: Vec::new(),
            processors: Vec::new(),
            cache,
            metrics,
        }
    }

    /// Create a proxy with the backends named in `config`
    ///
    /// Loaders are tried file first, then HTTP.
    pub fn from_config(config: &RelayConfig, metrics: Option<RelayMetrics>) -> Result<Self> {
        let mut proxy = Self::build(config, metrics);
        if let Some(ref file) = config.file_loader {
            info!(base_dir = %file.base_dir, "file loader enabled");
            proxy = proxy.with_loader(Arc::new(FileStore::from_config(file)));
        }
        if let Some(ref http) = config.http_loader {
            info!(base_url = ?http.base_url, "http loader enabled");
            proxy = proxy.with_loader(Arc::new(HttpLoader::from_config(http)?));
        }
        if let Some(ref storage) = config.file_storage {
            info!(base_dir = %storage.base_dir, "file storage enabled");
            proxy = proxy.with_storage(Arc::new(FileStore::from_config(storage)));
        }
        Ok(proxy)
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.push(storage);
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Replace the load cache, e.g. to share one between proxies
    pub fn with_cache(mut self, cache: DedupCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub fn metrics(&self) -> Option<&RelayMetrics> {
        self.metrics.as_ref()
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Start every processor in order, stopping at the first failure
    pub async fn startup(&self, ctx: &RequestContext) -> Result<()> {
        for processor in &self.processors {
            processor.startup(ctx).await?;
        }
        Ok(())
    }

    /// Shut down every processor in order, stopping at the first failure
    pub async fn shutdown(&self, ctx: &RequestContext) -> Result<()> {
        for processor in &self.processors {
            processor.shutdown(ctx).await?;
        }
        Ok(())
    }

    /// Handle a parsed request
    ///
    /// # Returns
    /// The processed image, or the error with any fallback body. Loaders are
    /// never invoked for requests that fail authorization.
    pub async fn handle(&self, ctx: &RequestContext, params: &Params) -> Outcome {
        let ctx = ctx.with_timeout(self.request_timeout);
        if self.debug {
            debug!(request_id = ctx.request_id(), params = ?params, "handling request");
        }

        if !(self.unsafe_mode && params.unsafe_)
            && !params.verify(&self.secret, self.signature_algorithm)
        {
            if self.debug {
                debug!(
                    request_id = ctx.request_id(),
                    path = %params.path,
                    expected = %self.signature_algorithm.sign(&params.path, &self.secret),
                    "hash mismatch"
                );
            } else {
                warn!(request_id = ctx.request_id(), path = %params.path, "hash mismatch");
            }
            return Outcome::failed(RelayError::HashMismatch.into());
        }

        let buf = match self.load(&ctx, &params.image).await {
            Ok(buf) => buf,
            Err(e) => return Outcome::failed(e),
        };

        let load = RequestLoader {
            proxy: self,
            ctx: &ctx,
        };
        match process_chain(&ctx, &self.processors, buf, params, &load).await {
            Ok(processed) => Outcome {
                buf: processed.buf,
                meta: processed.meta,
                err: None,
            },
            Err(e) => Outcome::failed(e),
        }
    }

    /// Load `image` through the cache, persisting fresh results
    pub async fn load(
        &self,
        ctx: &RequestContext,
        image: &str,
    ) -> std::result::Result<Bytes, PartialError> {
        let loaders = self.loaders.clone();
        let storages = self.storages.clone();
        let save_timeout = self.save_timeout;
        let metrics = self.metrics.clone();
        let key = image.to_string();

        self.cache
            .resolve(
                ctx,
                image,
                self.request_timeout,
                self.result_ttl,
                self.error_ttl,
                move |fill_ctx| async move {
                    let outcome = load_chain(&fill_ctx, &loaders, &key, metrics.as_ref()).await;
                    if let Ok(ref buf) = outcome {
                        if !storages.is_empty() {
                            persist(&fill_ctx, &storages, &key, buf, save_timeout, metrics);
                        }
                    }
                    outcome
                },
            )
            .await
    }
}

/// Auxiliary loads issued by processors, bound to the originating request
struct RequestLoader<'a> {
    proxy: &'a RelayProxy,
    ctx: &'a RequestContext,
}

#[async_trait]
impl LoadFunc for RequestLoader<'_> {
    async fn load(&self, image: &str) -> std::result::Result<Bytes, PartialError> {
        self.proxy.load(self.ctx, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processed;
    use crate::signature::sign;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Loader for Counting {
        async fn load(
            &self,
            _ctx: &RequestContext,
            image: &str,
        ) -> std::result::Result<Bytes, PartialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("bytes of {}", image)))
        }
    }

    /// Appends the bytes of a watermark image fetched through the loader callback.
    struct Watermark;

    #[async_trait]
    impl Processor for Watermark {
        async fn process(
            &self,
            _ctx: &RequestContext,
            buf: Bytes,
            _params: &Params,
            load: &dyn LoadFunc,
        ) -> std::result::Result<Processed, PartialError> {
            let mark = load.load("mark.png").await?;
            let mut out = buf.to_vec();
            out.extend_from_slice(b" + ");
            out.extend_from_slice(&mark);
            Ok(Processed {
                buf: Bytes::from(out),
                meta: None,
            })
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            secret: "s3cret".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_signed_request_loads() {
        let loader = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let proxy = RelayProxy::new(&config()).with_loader(loader.clone());
        let token = sign("a.jpg", "s3cret");
        let params = Params::parse(&format!("/{}/a.jpg", token)).unwrap();

        let outcome = proxy.handle(&RequestContext::new(), &params).await;
        assert!(outcome.err.is_none());
        assert_eq!(outcome.buf, Bytes::from_static(b"bytes of a.jpg"));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsafe_rejected_when_disabled() {
        let loader = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let proxy = RelayProxy::new(&config()).with_loader(loader.clone());
        let params = Params::parse("/unsafe/a.jpg").unwrap();

        let outcome = proxy.handle(&RequestContext::new(), &params).await;
        assert_eq!(outcome.err, Some(RelayError::HashMismatch));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_processor_loads_through_cache() {
        let loader = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let mut cfg = config();
        cfg.unsafe_mode = true;
        let proxy = RelayProxy::new(&cfg)
            .with_loader(loader.clone())
            .with_processor(Arc::new(Watermark));
        let params = Params::parse("/unsafe/a.jpg").unwrap();

        for _ in 0..2 {
            let outcome = proxy.handle(&RequestContext::new(), &params).await;
            assert_eq!(
                outcome.buf,
                Bytes::from_static(b"bytes of a.jpg + bytes of mark.png")
            );
        }
        // a.jpg and mark.png once each; the second request is served from cache.
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_loaders_is_not_found() {
        let mut cfg = config();
        cfg.unsafe_mode = true;
        let proxy = RelayProxy::new(&cfg);
        let params = Params::parse("/unsafe/a.jpg").unwrap();
        let outcome = proxy.handle(&RequestContext::new(), &params).await;
        assert_eq!(outcome.err, Some(RelayError::NotFound));
    }

    #[tokio::test]
    async fn test_from_config_reports_cache_lookups() {
        let metrics = RelayMetrics::new().unwrap();
        let mut cfg = config();
        cfg.unsafe_mode = true;
        let proxy = RelayProxy::from_config(&cfg, Some(metrics.clone()))
            .unwrap()
            .with_loader(Arc::new(Counting {
                calls: AtomicUsize::new(0),
            }));
        let params = Params::parse("/unsafe/a.jpg").unwrap();

        for _ in 0..2 {
            proxy.handle(&RequestContext::new(), &params).await;
        }
        let text = metrics.encode().unwrap();
        assert!(text.contains("pixrelay_cache_lookups_total{result=\"miss\"} 1"));
        assert!(text.contains("pixrelay_cache_lookups_total{result=\"hit\"} 1"));
        assert_eq!(proxy.cache().get_stats().total_entries, 1);
    }
}
