//! pixrelay
//!
//! Request orchestration core for an on-the-fly image server. A request names
//! an original image and a set of transformation options in its URL path;
//! pixrelay authorizes it, loads the original through an ordered chain of
//! loaders, persists fresh originals in the background and runs the bytes
//! through an ordered chain of processors.
//!
//! # Features
//!
//! - **Signed URLs**: HMAC signatures over the option path, with an opt-in
//!   unsafe mode for development
//! - **Load Deduplication**: concurrent requests for one image share a single
//!   load; outcomes are kept in a sharded TTL/LRU cache
//! - **Fallback Chains**: loaders and processors are tried in order, with
//!   partial bodies kept as fallback responses
//! - **Detached Persistence**: saves keep running after the request is gone
//! - **Metrics Collection**: Prometheus counters and histograms on a
//!   separate endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pixrelay::{FileStore, RelayConfig, RelayProxy, RequestContext, Params};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::from_file("pixrelay.yaml")?;
//! let proxy = RelayProxy::new(&config)
//!     .with_loader(Arc::new(FileStore::new("/srv/images")));
//!
//! let params = Params::parse("/unsafe/300x200/cat.jpg")?;
//! let outcome = proxy.handle(&RequestContext::new(), &params).await;
//! println!("{} bytes, error: {:?}", outcome.buf.len(), outcome.err);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`RelayProxy`]: authorizes requests and drives the chains
//! - [`DedupCache`]: single-flight result cache in front of the loader chain
//! - [`Loader`] / [`Storage`]: sources and sinks of original images
//!   ([`FileStore`], [`HttpLoader`])
//! - [`Processor`]: transformation stages
//! - [`RelayServer`]: hyper front end
//! - [`RelayMetrics`]: Prometheus collectors
//!
//! # Configuration
//!
//! ```yaml
//! bind_address: "0.0.0.0:8000"
//! secret: "change-me"
//! request_timeout_ms: 30000
//! cache:
//!   max_entries: 1000
//!   result_ttl_secs: 60
//! file_loader:
//!   base_dir: /srv/images
//! ```
//!
//! See [`RelayConfig`] for every option.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod file_store;
pub mod http_loader;
pub mod loader;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod persist;
pub mod processor;
pub mod proxy;
pub mod response;
pub mod server;
pub mod signature;

// Re-export commonly used types
pub use cache::{CacheStats, DedupCache};
pub use config::RelayConfig;
pub use context::RequestContext;
pub use error::{classify, classify_any, ClassifiedError, PartialError, RelayError, Result};
pub use file_store::FileStore;
pub use http_loader::HttpLoader;
pub use loader::{load_chain, Loader, Storage};
pub use metrics::RelayMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{Meta, Params, NAME, VERSION};
pub use persist::persist;
pub use processor::{process_chain, LoadFunc, Processed, Processor};
pub use proxy::{Outcome, RelayProxy};
pub use server::RelayServer;
pub use signature::SignatureAlgorithm;
