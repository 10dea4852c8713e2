//! Background persistence of loaded images
//!
//! Saves run as independent tasks. They keep the request's informational
//! values for logging but not its cancellation, so a request that finishes or
//! is aborted never interrupts a save in progress.

use crate::context::RequestContext;
use crate::loader::Storage;
use crate::metrics::RelayMetrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawn one save per storage
///
/// # Arguments
/// * `ctx` - Request context the saves are derived from
/// * `storages` - Destinations, each saved to independently
/// * `image` - Image identifier
/// * `buf` - Loaded bytes
/// * `save_timeout` - Deadline for each save, zero for none
/// * `metrics` - Optional collector for save results
///
/// # Returns
/// Handles of the spawned saves. The request path drops them; tests and
/// shutdown can await them.
pub fn persist(
    ctx: &RequestContext,
    storages: &[Arc<dyn Storage>],
    image: &str,
    buf: &Bytes,
    save_timeout: Duration,
    metrics: Option<RelayMetrics>,
) -> Vec<JoinHandle<()>> {
    storages
        .iter()
        .enumerate()
        .map(|(idx, storage)| {
            let storage = Arc::clone(storage);
            let save_ctx = ctx.detached().with_timeout(save_timeout);
            let image = image.to_string();
            let buf = buf.clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let result = save_ctx
                    .run(storage.save(&save_ctx, &image, &buf))
                    .await
                    .and_then(|saved| saved);
                let saved = result.is_ok();
                match result {
                    Ok(()) => {
                        debug!(
                            request_id = save_ctx.request_id(),
                            image = %image,
                            storage = idx,
                            size = buf.len(),
                            "saved"
                        );
                    }
                    Err(e) => {
                        error!(
                            request_id = save_ctx.request_id(),
                            image = %image,
                            storage = idx,
                            error = %e,
                            "save failed"
                        );
                    }
                }
                if let Some(metrics) = metrics {
                    metrics.record_save(saved);
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RelayError, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Storage for Recorder {
        async fn save(&self, _ctx: &RequestContext, image: &str, _buf: &Bytes) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.lock().unwrap().push(image.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Storage for Failing {
        async fn save(&self, _ctx: &RequestContext, _image: &str, _buf: &Bytes) -> Result<()> {
            Err(RelayError::IoError("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_save_survives_request_cancel() {
        let recorder = Arc::new(Recorder::default());
        let storages: Vec<Arc<dyn Storage>> = vec![recorder.clone()];
        let ctx = RequestContext::new();

        let handles = persist(&ctx, &storages, "a.jpg", &Bytes::from_static(b"x"), Duration::ZERO, None);
        ctx.cancel();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*recorder.0.lock().unwrap(), vec!["a.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_is_counted_not_propagated() {
        let metrics = RelayMetrics::new().unwrap();
        let storages: Vec<Arc<dyn Storage>> = vec![Arc::new(Failing), Arc::new(Recorder::default())];
        let handles = persist(
            &RequestContext::new(),
            &storages,
            "a.jpg",
            &Bytes::from_static(b"x"),
            Duration::from_secs(1),
            Some(metrics.clone()),
        );
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(metrics.saves_total.with_label_values(&["failure"]).get(), 1.0);
        assert_eq!(metrics.saves_total.with_label_values(&["success"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_save_timeout() {
        let metrics = RelayMetrics::new().unwrap();
        let storages: Vec<Arc<dyn Storage>> = vec![Arc::new(Recorder::default())];
        let handles = persist(
            &RequestContext::new(),
            &storages,
            "a.jpg",
            &Bytes::from_static(b"x"),
            Duration::from_millis(1),
            Some(metrics.clone()),
        );
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(metrics.saves_total.with_label_values(&["failure"]).get(), 1.0);
    }
}
