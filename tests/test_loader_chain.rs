//! Integration tests for the loader fallback chain

use async_trait::async_trait;
use bytes::Bytes;
use pixrelay::{load_chain, Loader, PartialError, RelayConfig, RelayError, RelayProxy, RequestContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Loader returning a fixed outcome and counting calls
struct Scripted {
    outcome: Result<Bytes, PartialError>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(outcome: Result<Bytes, PartialError>) -> Arc<Self> {
        Arc::new(Scripted {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for Scripted {
    async fn load(&self, _ctx: &RequestContext, _image: &str) -> Result<Bytes, PartialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

#[tokio::test]
async fn test_first_success_stops_chain() {
    let first = Scripted::new(Err(RelayError::Pass.into()));
    let second = Scripted::new(Ok(Bytes::from_static(b"B")));
    let third = Scripted::new(Ok(Bytes::from_static(b"C")));
    let loaders: Vec<Arc<dyn Loader>> = vec![first.clone(), second.clone(), third.clone()];

    let out = load_chain(&RequestContext::new(), &loaders, "img.jpg", None).await;
    assert_eq!(out, Ok(Bytes::from_static(b"B")));
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
    assert_eq!(third.calls(), 0);
}

#[tokio::test]
async fn test_errors_do_not_stop_chain() {
    let broken = Scripted::new(Err(RelayError::IoError("disk on fire".into()).into()));
    let good = Scripted::new(Ok(Bytes::from_static(b"ok")));
    let loaders: Vec<Arc<dyn Loader>> = vec![broken.clone(), good.clone()];

    let out = load_chain(&RequestContext::new(), &loaders, "img.jpg", None).await;
    assert_eq!(out, Ok(Bytes::from_static(b"ok")));
    assert_eq!(broken.calls(), 1);
}

#[tokio::test]
async fn test_exhaustion_returns_last_error() {
    let loaders: Vec<Arc<dyn Loader>> = vec![
        Scripted::new(Err(RelayError::Pass.into())),
        Scripted::new(Err(RelayError::Timeout.into())),
    ];
    let out = load_chain(&RequestContext::new(), &loaders, "img.jpg", None).await;
    assert_eq!(out.unwrap_err().error, RelayError::Timeout);
}

#[tokio::test]
async fn test_all_pass_is_not_found() {
    let loaders: Vec<Arc<dyn Loader>> = vec![
        Scripted::new(Err(RelayError::Pass.into())),
        Scripted::new(Err(RelayError::Pass.into())),
    ];
    let out = load_chain(&RequestContext::new(), &loaders, "img.jpg", None).await;
    let err = out.unwrap_err();
    assert_eq!(err.error, RelayError::NotFound);
    assert!(err.buf.is_empty());
}

#[tokio::test]
async fn test_latest_fallback_bytes_win() {
    let loaders: Vec<Arc<dyn Loader>> = vec![
        Scripted::new(Err(PartialError::new(
            RelayError::NotFound,
            Bytes::from_static(b"first"),
        ))),
        Scripted::new(Err(PartialError::new(
            RelayError::NotFound,
            Bytes::from_static(b"second"),
        ))),
        Scripted::new(Err(RelayError::Pass.into())),
    ];
    let out = load_chain(&RequestContext::new(), &loaders, "img.jpg", None).await;
    assert_eq!(out.unwrap_err().buf, Bytes::from_static(b"second"));
}

#[tokio::test]
async fn test_proxy_load_is_cached_per_identifier() {
    let loader = Scripted::new(Ok(Bytes::from_static(b"data")));
    let config = RelayConfig {
        unsafe_mode: true,
        ..Default::default()
    };
    let proxy = RelayProxy::new(&config).with_loader(loader.clone());

    for _ in 0..3 {
        let out = proxy.load(&RequestContext::new(), "same.jpg").await;
        assert_eq!(out, Ok(Bytes::from_static(b"data")));
    }
    proxy.load(&RequestContext::new(), "other.jpg").await.unwrap();
    assert_eq!(loader.calls(), 2);
}
