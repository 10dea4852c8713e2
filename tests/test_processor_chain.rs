//! Integration tests for the processor chain and processor lifecycle

use async_trait::async_trait;
use bytes::Bytes;
use pixrelay::{
    LoadFunc, Loader, Meta, Params, PartialError, Processed, Processor, RelayConfig, RelayError,
    RelayProxy, RequestContext, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

struct Stage {
    name: &'static str,
    outcome: std::result::Result<Processed, PartialError>,
    fail_startup: bool,
    log: Log,
    calls: AtomicUsize,
}

impl Stage {
    fn new(
        name: &'static str,
        outcome: std::result::Result<Processed, PartialError>,
        log: &Log,
    ) -> Arc<Self> {
        Arc::new(Stage {
            name,
            outcome,
            fail_startup: false,
            log: log.clone(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Processor for Stage {
    async fn startup(&self, _ctx: &RequestContext) -> Result<()> {
        self.log.lock().unwrap().push(format!("startup {}", self.name));
        if self.fail_startup {
            return Err(RelayError::InternalError(format!("{} refused to start", self.name)));
        }
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &RequestContext,
        buf: Bytes,
        _params: &Params,
        _load: &dyn LoadFunc,
    ) -> std::result::Result<Processed, PartialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(format!("process {} {}", self.name, String::from_utf8_lossy(&buf)));
        self.outcome.clone()
    }

    async fn shutdown(&self, _ctx: &RequestContext) -> Result<()> {
        self.log.lock().unwrap().push(format!("shutdown {}", self.name));
        Ok(())
    }
}

struct Original;

#[async_trait]
impl Loader for Original {
    async fn load(&self, _ctx: &RequestContext, _image: &str) -> std::result::Result<Bytes, PartialError> {
        Ok(Bytes::from_static(b"orig"))
    }
}

fn proxy() -> RelayProxy {
    let config = RelayConfig {
        unsafe_mode: true,
        ..Default::default()
    };
    RelayProxy::new(&config).with_loader(Arc::new(Original))
}

fn params() -> Params {
    Params::parse("/unsafe/meta/100x100/a.png").unwrap()
}

#[tokio::test]
async fn test_first_success_wins() {
    let log = Log::default();
    let meta = Meta {
        format: "png".into(),
        content_type: "image/png".into(),
        width: 100,
        height: 100,
        orientation: 1,
    };
    let winner = Stage::new(
        "b",
        Ok(Processed {
            buf: Bytes::from_static(b"resized"),
            meta: Some(meta.clone()),
        }),
        &log,
    );
    let never = Stage::new("c", Ok(Processed::default()), &log);
    let proxy = proxy()
        .with_processor(Stage::new("a", Err(RelayError::Pass.into()), &log))
        .with_processor(winner)
        .with_processor(never.clone());

    let outcome = proxy.handle(&RequestContext::new(), &params()).await;
    assert!(outcome.err.is_none());
    assert_eq!(outcome.buf, Bytes::from_static(b"resized"));
    assert_eq!(outcome.meta, Some(meta));
    assert_eq!(never.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pass_with_bytes_replaces_input() {
    let log = Log::default();
    let proxy = proxy()
        .with_processor(Stage::new(
            "normalize",
            Err(PartialError::pass_with(Bytes::from_static(b"norm"))),
            &log,
        ))
        .with_processor(Stage::new(
            "fail",
            Err(RelayError::UnsupportedFormat("heic".into()).into()),
            &log,
        ));

    let outcome = proxy.handle(&RequestContext::new(), &params()).await;
    assert_eq!(outcome.err, Some(RelayError::UnsupportedFormat("heic".into())));
    // The normalized buffer is the fallback body.
    assert_eq!(outcome.buf, Bytes::from_static(b"norm"));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["process normalize orig".to_string(), "process fail norm".to_string()]
    );
}

#[tokio::test]
async fn test_no_processors_returns_loaded_bytes() {
    let outcome = proxy().handle(&RequestContext::new(), &params()).await;
    assert!(outcome.err.is_none());
    assert_eq!(outcome.buf, Bytes::from_static(b"orig"));
    assert!(outcome.meta.is_none());
}

#[tokio::test]
async fn test_startup_and_shutdown_run_in_order() {
    let log = Log::default();
    let proxy = proxy()
        .with_processor(Stage::new("a", Err(RelayError::Pass.into()), &log))
        .with_processor(Stage::new("b", Err(RelayError::Pass.into()), &log));

    let ctx = RequestContext::new();
    proxy.startup(&ctx).await.unwrap();
    proxy.shutdown(&ctx).await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["startup a", "startup b", "shutdown a", "shutdown b"]
    );
}

#[tokio::test]
async fn test_startup_fails_fast() {
    let log = Log::default();
    let broken = Arc::new(Stage {
        name: "broken",
        outcome: Err(RelayError::Pass.into()),
        fail_startup: true,
        log: log.clone(),
        calls: AtomicUsize::new(0),
    });
    let proxy = proxy()
        .with_processor(broken)
        .with_processor(Stage::new("after", Err(RelayError::Pass.into()), &log));

    let err = proxy.startup(&RequestContext::new()).await.unwrap_err();
    assert_eq!(err.kind(), "internal");
    assert_eq!(*log.lock().unwrap(), vec!["startup broken"]);
}
