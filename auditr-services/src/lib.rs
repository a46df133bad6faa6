//! Runtime-facing implementations that perform actual I/O: the batching
//! publisher (C5/C6) and the configuration fetcher/watcher (C8). Everything
//! here runs on Tokio; the I/O-free abstractions it builds on live in
//! `auditr-core`.

pub mod batch;
pub mod client;
pub mod error;
pub mod fetcher;
pub mod publisher;

pub use batch::{BatchList, Response, ResponseSink};
pub use client::default_client;
pub use error::{FetchError, PublishError};
pub use fetcher::{Fetcher, FetcherConfig};
pub use publisher::{Publisher, PublisherConfig};
