//! Fetcher/Watcher: a ticker-driven remote GET
//! against the control-plane `ConfigURL`, writing the response body to a
//! local cache file. Also hosts the cache-file filesystem watch the
//! Configurer's design assigns to this layer: this crate is the one that
//! already depends on `notify` and owns an async runtime to spawn onto, so
//! the watcher lives here and simply calls back into
//! `auditr_core::Configurer::refresh` (itself synchronous and I/O-free) on
//! every debounced change (see `DESIGN.md`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use auditr_core::Configuration;

use crate::error::FetchError;

/// Floor below which the fetch interval never drops, regardless of a
/// server-advertised `cache_duration`.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Seed configuration required at process init.
/// Missing `config_url` or `api_key` is fatal at `Agent::from_env`.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub config_url: String,
    pub api_key: String,
    pub cache_file_path: PathBuf,
    /// An explicit interval override. When set, suppresses the
    /// server-advertised `cache_duration`-minus-jitter adjustment entirely.
    pub interval_override: Option<Duration>,
}

impl FetcherConfig {
    pub fn new(config_url: impl Into<String>, api_key: impl Into<String>, cache_file_path: impl Into<PathBuf>) -> Self {
        FetcherConfig {
            config_url: config_url.into(),
            api_key: api_key.into(),
            cache_file_path: cache_file_path.into(),
            interval_override: None,
        }
    }
}

/// Periodic remote GET plus cache-file write. Owns no state beyond its
/// configuration and HTTP client; the running ticker is a detached Tokio
/// task started by [`Fetcher::spawn`].
pub struct Fetcher {
    config: FetcherConfig,
    http_client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: FetcherConfig, http_client: reqwest::Client) -> Self {
        Fetcher { config, http_client }
    }

    /// Performs one fetch-and-cache cycle: authenticated GET, full body
    /// read, write to the cache file (mode `0644`), and the next interval
    /// this cycle implies. Any failing step leaves the
    /// previous cache untouched and returns [`FetchError`].
    async fn fetch_once(&self) -> Result<(Vec<u8>, Duration), FetchError> {
        let response = self
            .http_client
            .get(&self.config.config_url)
            .header(reqwest::header::AUTHORIZATION, &self.config.api_key)
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|err| FetchError::Request(err.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;

        write_cache_file(&self.config.cache_file_path, &body)?;

        let next_interval = self.next_interval(&body);
        Ok((body.to_vec(), next_interval))
    }

    /// Resolves the interval for the *next* tick: the explicit override if
    /// set, else the server-advertised `cache_duration` (parsed best-effort
    /// from the just-fetched body) minus a uniform jitter in `[0, 10)` s,
    /// floored at [`MIN_INTERVAL`].
    fn next_interval(&self, body: &[u8]) -> Duration {
        if let Some(override_interval) = self.config.interval_override {
            return override_interval;
        }
        let advertised = Configuration::parse(body)
            .map(|c| c.cache_duration)
            .unwrap_or(MIN_INTERVAL);
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..10));
        advertised.saturating_sub(jitter).max(MIN_INTERVAL)
    }

    /// Performs one fetch-and-cache cycle immediately, bypassing the
    /// ticker. Used for the cold-start bootstrap so a freshly constructed
    /// agent has route configuration from the first request rather than
    /// only after the first tick elapses.
    pub async fn fetch_now(&self) -> Result<(), FetchError> {
        self.fetch_once().await.map(|_| ())
    }

    /// Starts the ticker loop as a detached Tokio task. Returns channels
    /// emitting each fresh configuration body (`refreshes()`) and each
    /// fetch/write failure (`errors()`), plus a handle that stops the loop
    /// when dropped or explicitly told to.
    pub fn spawn(self: Arc<Self>) -> (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<FetchError>, FetcherHandle) {
        let (refreshes_tx, refreshes_rx) = mpsc::channel(4);
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let initial_interval = self.config.interval_override.unwrap_or(MIN_INTERVAL);
        let join = tokio::spawn(async move {
            let mut interval = initial_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut stop_rx => {
                        tracing::debug!("fetcher ticker stopped");
                        return;
                    }
                }
                match self.fetch_once().await {
                    Ok((body, next_interval)) => {
                        interval = next_interval;
                        tracing::info!(interval_secs = interval.as_secs(), "audit config fetched");
                        if refreshes_tx.send(body).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "audit config fetch failed");
                        let _ = errors_tx.send(err).await;
                    }
                }
            }
        });

        (refreshes_rx, errors_rx, FetcherHandle { stop_tx: Some(stop_tx), join })
    }
}

fn write_cache_file(path: &std::path::Path, body: &[u8]) -> Result<(), FetchError> {
    std::fs::write(path, body).map_err(|err| FetchError::CacheWrite {
        path: path.display().to_string(),
        source: err.to_string(),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).map_err(|err| FetchError::CacheWrite {
            path: path.display().to_string(),
            source: err.to_string(),
        })?;
    }
    Ok(())
}

/// Handle to a running [`Fetcher::spawn`] ticker task. Dropping it (or
/// calling [`Self::stop`]) cancels the ticker; `Agent::shutdown` (auditr
/// crate) awaits `.stop()` as part of a clean drain.
pub struct FetcherHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl FetcherHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Watches the cache file for WRITE/CREATE events and invokes `on_change`
/// once per debounced burst.
/// Installing a new watcher cancels and awaits any prior one first; the
/// cancellation is acknowledged on `watcher_done` for testability.
pub struct CacheFileWatcher {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    watcher_done_rx: Option<oneshot::Receiver<()>>,
    join: Option<JoinHandle<()>>,
}

impl CacheFileWatcher {
    /// Installs a watcher on `path`, calling `on_change` (synchronously,
    /// off the async runtime's reactor thread — callers typically pass a
    /// closure that just calls [`auditr_core::Configurer::refresh`]) no
    /// more than once per `debounce` window.
    pub fn install(
        path: PathBuf,
        debounce: Duration,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, FetchError> {
        let (fs_tx, fs_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = RecommendedWatcher::new(fs_tx, notify::Config::default())
            .map_err(|err| FetchError::Watch(err.to_string()))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|err| FetchError::Watch(err.to_string()))?;

        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        let join = tokio::task::spawn_blocking(move || {
            // Keep the watcher alive for the lifetime of this thread; it is
            // dropped (and stops watching) when the closure returns.
            let _watcher = watcher;
            let mut last_event: Option<std::time::Instant> = None;
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                match fs_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(event)) => {
                        if is_write_or_create(&event) {
                            last_event = Some(std::time::Instant::now());
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "cache file watch error");
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
                if let Some(seen_at) = last_event {
                    if seen_at.elapsed() >= debounce {
                        on_change();
                        last_event = None;
                    }
                }
            }
            let _ = done_tx.send(());
        });

        Ok(CacheFileWatcher {
            stop_tx: Some(stop_tx),
            watcher_done_rx: Some(done_rx),
            join: Some(join),
        })
    }

    /// Cancels this watcher and waits for the `watcherDone` acknowledgement
    ///. Any prior watcher must be stopped this way before a
    /// new one is installed on the same path.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.watcher_done_rx.take() {
            let _ = rx.await;
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

fn is_write_or_create(event: &notify::Event) -> bool {
    matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_))
}
