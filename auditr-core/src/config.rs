//! Parsed configuration document and the hardcoded
//! defaults substituted for zero-valued numeric fields.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::route::Route;

/// Default events per batch before a flush fires.
pub const DEFAULT_MAX_EVENTS_PER_BATCH: u32 = 10;
/// Default worker-pool size / concurrent bucket count.
pub const DEFAULT_MAX_CONCURRENT_BATCHES: u32 = 4;
/// Default pending-work channel capacity.
pub const DEFAULT_PENDING_WORK_CAPACITY: u32 = 100;
/// Default per-batch flush interval.
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 1_000;
/// Default freshness window before `refresh` re-fetches.
pub const DEFAULT_CACHE_DURATION_SECS: u64 = 300;
/// Per-event encoded size ceiling.
pub const MAX_EVENT_BYTES: usize = 25_000;
/// Fixed bucket width for the overflow map.
pub const OVERFLOW_BUCKET_WIDTH: usize = 10;
/// Bound on overflow-drain rounds before giving up silently.
pub const MAX_OVERFLOW_ROUNDS: usize = 10;

#[derive(Debug, Clone, Deserialize, Default)]
struct RawRoute {
    #[serde(default)]
    method: String,
    #[serde(default)]
    path: String,
}

/// Mirrors the wire JSON document field-for-field. Unknown
/// keys are ignored by `serde_json` by default (no `deny_unknown_fields`);
/// every field defaults to its zero value when absent, which `Configuration`
/// then resolves against the hardcoded defaults above.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    parent_org_id: String,
    org_id_field: String,
    base_url: String,
    events_path: String,
    target: Vec<RawRoute>,
    sample: Vec<RawRoute>,
    cache_duration: u64,
    flush: bool,
    max_events_per_batch: u32,
    max_concurrent_batches: u32,
    pending_work_capacity: u32,
    send_interval: u64,
    block_on_send: bool,
    block_on_response: bool,
}

/// Parsed, defaults-resolved form of the configuration document.
///
/// The Configurer (C7) owns the live instance and replaces it atomically;
/// every other component holds a read-only snapshot obtained through a
/// subscriber callback.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub parent_org_id: String,
    pub org_id_field: String,
    pub events_url: String,
    pub target_routes: Vec<Route>,
    pub sample_routes: Vec<Route>,
    pub cache_duration: Duration,
    pub flush_after_each_event: bool,
    pub max_events_per_batch: u32,
    pub max_concurrent_batches: u32,
    pub pending_work_capacity: u32,
    pub send_interval: Duration,
    pub block_on_send: bool,
    pub block_on_response: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::from_raw(RawConfig::default())
    }
}

impl Configuration {
    /// Parses a configuration document. Fails with [`ConfigError::Invalid`]
    /// on malformed JSON; the caller (Configurer) is responsible for
    /// retaining the previous `Configuration` on error.
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_slice(bytes)?;
        Ok(Configuration::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        Configuration {
            parent_org_id: raw.parent_org_id,
            org_id_field: raw.org_id_field,
            events_url: join_url(&raw.base_url, &raw.events_path),
            target_routes: raw.target.into_iter().map(|r| Route::new(r.method, r.path)).collect(),
            sample_routes: raw.sample.into_iter().map(|r| Route::new(r.method, r.path)).collect(),
            cache_duration: non_zero_or(raw.cache_duration, DEFAULT_CACHE_DURATION_SECS, Duration::from_secs),
            flush_after_each_event: raw.flush,
            max_events_per_batch: if raw.max_events_per_batch == 0 {
                DEFAULT_MAX_EVENTS_PER_BATCH
            } else {
                raw.max_events_per_batch
            },
            max_concurrent_batches: if raw.max_concurrent_batches == 0 {
                DEFAULT_MAX_CONCURRENT_BATCHES
            } else {
                raw.max_concurrent_batches
            },
            pending_work_capacity: if raw.pending_work_capacity == 0 {
                DEFAULT_PENDING_WORK_CAPACITY
            } else {
                raw.pending_work_capacity
            },
            send_interval: non_zero_or(raw.send_interval, DEFAULT_SEND_INTERVAL_MS, Duration::from_millis),
            block_on_send: raw.block_on_send,
            block_on_response: raw.block_on_response,
        }
    }
}

fn non_zero_or(value: u64, default: u64, to_duration: fn(u64) -> Duration) -> Duration {
    to_duration(if value == 0 { default } else { value })
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
