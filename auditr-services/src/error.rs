//! Publish- and fetch-path error kinds. These never unwind;
//! they are either returned to the caller or delivered on a response/error
//! channel, per the spec's recovery policy.

/// Per-event / per-batch faults surfaced on the publisher's response
/// channel (`ERR_QUEUE_OVERFLOW`, `ERR_EVENT_TOO_LARGE`, `ERR_ENCODE`,
/// `ERR_HTTP_TRANSPORT`, `ERR_HTTP_STATUS`).
#[derive(thiserror::Error, Debug, Clone)]
pub enum PublishError {
    #[error("queue overflow")]
    QueueOverflow,
    #[error("event exceeds max size of {0} bytes")]
    EventTooLarge(usize),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("http transport error: {0}")]
    HttpTransport(String),
    #[error("http status {status}")]
    HttpStatus { status: u16, body: String },
    #[error(transparent)]
    WrongEnvelope(#[from] auditr_core::BuildError),
}

/// `ERR_CONFIG_FETCH`: emitted on the fetcher's error channel. The cache
/// file and last-known configuration are left untouched.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    #[error("config fetch failed: {0}")]
    Request(String),
    #[error("failed to write cache file {path}: {source}")]
    CacheWrite { path: String, source: String },
    #[error("cache file watch failed: {0}")]
    Watch(String),
}
