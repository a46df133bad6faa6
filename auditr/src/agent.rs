//! Agent: the composition root. Wires
//! the Fetcher, Configurer, Router, and Publisher together, bootstraps them
//! from the environment, and exposes the `tower::Layer` the host installs.
//!
//! A reload loop driving a set of subscribers, generalized from service
//! factories to the fixed Router/Publisher pair this crate ships.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use auditr_core::config::Configuration;
use auditr_core::error::AnyError;
use auditr_core::route::Router;
use auditr_core::util::file_read_sync;
use auditr_core::Configurer;
use auditr_services::fetcher::{CacheFileWatcher, Fetcher, FetcherConfig, FetcherHandle};
use auditr_services::{Publisher, PublisherConfig, Response};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::middleware::AuditLayer;

const DEFAULT_CACHE_FILE_PATH: &str = "/tmp/auditr-config";
const DEFAULT_WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

/// Bootstrap knobs beyond the bare `AUDITR_CONFIG_URL`/`AUDITR_API_KEY` env
/// vars: the cache file path, an explicit fetch-interval
/// override, and an HTTP client override for tests.
#[derive(Clone)]
pub struct AgentConfig {
    pub config_url: String,
    pub api_key: String,
    pub cache_file_path: PathBuf,
    pub fetch_interval_override: Option<Duration>,
    pub http_client: reqwest::Client,
}

impl AgentConfig {
    pub fn new(config_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        AgentConfig {
            config_url: config_url.into(),
            api_key: api_key.into(),
            cache_file_path: PathBuf::from(DEFAULT_CACHE_FILE_PATH),
            fetch_interval_override: None,
            http_client: auditr_services::default_client(),
        }
    }

    pub fn with_cache_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file_path = path.into();
        self
    }

    pub fn with_fetch_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval_override = Some(interval);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    /// Reads `AUDITR_CONFIG_URL` / `AUDITR_API_KEY`, loading `ENV_PATH` (if
    /// set) via `dotenvy::from_path` first. Missing either
    /// required variable is fatal.
    pub fn from_env() -> Result<Self, AnyError> {
        if let Ok(env_path) = std::env::var("ENV_PATH") {
            dotenvy::from_path(&env_path).map_err(|err| anyhow::anyhow!("failed to load ENV_PATH {env_path}: {err}"))?;
        }
        let config_url = std::env::var("AUDITR_CONFIG_URL").map_err(|_| anyhow::anyhow!("AUDITR_CONFIG_URL is required"))?;
        let api_key = std::env::var("AUDITR_API_KEY").map_err(|_| anyhow::anyhow!("AUDITR_API_KEY is required"))?;
        Ok(AgentConfig::new(config_url, api_key))
    }
}

/// The wired system: background fetch/watch tasks, the live [`Configurer`],
/// and the [`Router`]/[`Publisher`] pair the middleware dispatches through.
pub struct Agent {
    configurer: Arc<Configurer>,
    router: Arc<Router>,
    publisher: Arc<Publisher>,
    fetcher_handle: Option<FetcherHandle>,
    fetch_refreshes_task: Option<JoinHandle<()>>,
    fetch_errors_task: Option<JoinHandle<()>>,
    cache_watcher: Option<CacheFileWatcher>,
}

impl Agent {
    /// Bootstraps from the process environment.
    pub async fn from_env() -> Result<(Self, mpsc::Receiver<Response>), AnyError> {
        Agent::new(AgentConfig::from_env()?).await
    }

    /// Constructs the wired system from an explicit [`AgentConfig`],
    /// reading the cache file once synchronously for the initial
    /// configuration, then spawning the periodic fetch and the cache-file
    /// watch as detached Tokio tasks onto the caller's runtime.
    ///
    /// Returns the `Agent` together with the response channel's receiving
    /// half; the caller owns
    /// draining it, typically by forwarding to its own logging/metrics.
    pub async fn new(config: AgentConfig) -> Result<(Self, mpsc::Receiver<Response>), AnyError> {
        let mut fetcher_config = FetcherConfig::new(config.config_url.clone(), config.api_key.clone(), config.cache_file_path.clone());
        fetcher_config.interval_override = config.fetch_interval_override;
        let fetcher = Arc::new(Fetcher::new(fetcher_config, config.http_client.clone()));

        // Cold-start bootstrap: fetch once synchronously so the agent is
        // configured from the first request rather than only after the
        // ticker's first interval elapses. Best-effort — a failure here
        // just means we fall back to whatever is already on disk (or the
        // zero-value default, on a truly first-ever run).
        if let Err(err) = fetcher.fetch_now().await {
            tracing::warn!(error = %err, "initial audit config fetch failed, starting from cached configuration");
        }

        let initial = load_initial_configuration(&config.cache_file_path);

        let cache_file_path = config.cache_file_path.clone();
        let configurer = Arc::new(Configurer::new(
            initial,
            Box::new(move || file_read_sync(&cache_file_path).map_err(AnyError::from)),
        ));
        // The cache file may not exist yet on a first-ever run; that is not
        // fatal, the agent simply starts with `Configuration::default()`
        // until the first fetch lands.
        let _ = configurer.force_refresh();

        let router = Arc::new(Router::new());
        apply_configuration(&router, &configurer.current());

        // Response channel capacity tracks twice the pending-work capacity.
        let responses_capacity = (configurer.current().pending_work_capacity as usize * 2).max(1);
        let (responses_tx, responses_rx) = mpsc::channel(responses_capacity);
        let publisher = Publisher::new(
            publisher_config(&configurer.current(), &config.api_key),
            auditr_core::event::default_builders(),
            config.http_client.clone(),
            responses_tx,
        );

        {
            let router = router.clone();
            configurer.on_refresh(move |cfg| apply_configuration(&router, cfg));
        }
        {
            let publisher = publisher.clone();
            let api_key = config.api_key.clone();
            configurer.on_refresh(move |cfg| {
                let publisher = publisher.clone();
                let publisher_config = publisher_config(cfg, &api_key);
                tokio::spawn(async move {
                    publisher.reconfigure(publisher_config).await;
                });
            });
        }

        let (mut refreshes, mut errors, fetcher_handle) = fetcher.spawn();

        let configurer_for_refreshes = configurer.clone();
        let fetch_refreshes_task = tokio::spawn(async move {
            while refreshes.recv().await.is_some() {
                if let Err(err) = configurer_for_refreshes.force_refresh() {
                    tracing::warn!(error = %err, "failed to apply freshly fetched configuration");
                }
            }
        });
        let fetch_errors_task = tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                tracing::warn!(error = %err, "audit config fetch failed");
            }
        });

        let cache_watcher = {
            let configurer = configurer.clone();
            CacheFileWatcher::install(config.cache_file_path.clone(), DEFAULT_WATCH_DEBOUNCE, move || {
                // A WRITE/CREATE on the cache file is a definitive change
                // signal and must always reparse, bypassing the freshness
                // gate `refresh()` applies to the ticker/poll path.
                if let Err(err) = configurer.force_refresh() {
                    tracing::warn!(error = %err, "cache file reparse failed");
                }
            })
            .map_err(|err| {
                tracing::warn!(error = %err, "cache file watch install failed, falling back to poll-only refresh");
                err
            })
            .ok()
        };

        Ok((
            Agent {
                configurer,
                router,
                publisher,
                fetcher_handle: Some(fetcher_handle),
                fetch_refreshes_task: Some(fetch_refreshes_task),
                fetch_errors_task: Some(fetch_errors_task),
                cache_watcher,
            },
            responses_rx,
        ))
    }

    /// The live configuration snapshot.
    pub fn configuration(&self) -> Arc<Configuration> {
        self.configurer.current()
    }

    /// The `tower::Layer` the host installs around its handler stack.
    pub fn layer(&self) -> AuditLayer {
        AuditLayer::new(self.router.clone(), self.publisher.clone())
    }

    /// Flushes the publisher's current batch without stopping background
    /// tasks.
    pub async fn flush(&self) {
        self.publisher.flush().await;
    }

    /// Drains the publisher and halts the fetch ticker and cache-file
    /// watch, giving the host a clean way to stop before process exit.
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.cache_watcher.take() {
            watcher.stop().await;
        }
        if let Some(handle) = self.fetcher_handle.take() {
            handle.stop().await;
        }
        if let Some(task) = self.fetch_refreshes_task.take() {
            task.abort();
        }
        if let Some(task) = self.fetch_errors_task.take() {
            task.abort();
        }
        self.publisher.shutdown().await;
    }
}

fn load_initial_configuration(cache_file_path: &Path) -> Configuration {
    file_read_sync(cache_file_path)
        .ok()
        .and_then(|bytes| Configuration::parse(&bytes).ok())
        .unwrap_or_default()
}

fn apply_configuration(router: &Router, config: &Configuration) {
    let failures = router.configure(&config.target_routes, &config.sample_routes);
    for (route, err) in failures {
        tracing::warn!(method = %route.method, path = %route.path, error = %err, "route registration failed, skipping");
    }
}

fn publisher_config(config: &Configuration, api_key: &str) -> PublisherConfig {
    PublisherConfig {
        parent_org_id: config.parent_org_id.clone(),
        org_id_field: config.org_id_field.clone(),
        events_url: config.events_url.clone(),
        api_key: api_key.to_string(),
        max_events_per_batch: config.max_events_per_batch,
        max_concurrent_batches: config.max_concurrent_batches,
        pending_work_capacity: config.pending_work_capacity,
        send_interval: config.send_interval,
        block_on_send: config.block_on_send,
        block_on_response: config.block_on_response,
        flush_after_each_event: config.flush_after_each_event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::method as method_matcher;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn from_env_bootstraps_router_and_publisher_from_fetched_config() {
        let server = MockServer::start().await;
        Mock::given(method_matcher("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"parent_org_id":"org-1","base_url":"https://collector.example","events_path":"/events","target":[{"method":"GET","path":"/person/:id"}]}"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_file_path = dir.path().join("auditr-config");
        let config = AgentConfig::new(server.uri(), "token-1")
            .with_cache_file_path(&cache_file_path)
            .with_fetch_interval(Duration::from_secs(60));

        let (agent, _responses_rx) = Agent::new(config).await.unwrap();

        assert_eq!(agent.router.find_route("GET", "/person/5"), Some(auditr_core::route::Route::new("GET", "/person/:id")));
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn cache_file_write_reparses_even_within_cache_duration() {
        let server = MockServer::start().await;
        Mock::given(method_matcher("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"parent_org_id":"org-1","base_url":"https://collector.example","events_path":"/events","cache_duration":300,"target":[{"method":"GET","path":"/person/:id"}]}"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_file_path = dir.path().join("auditr-config");
        let config = AgentConfig::new(server.uri(), "token-1")
            .with_cache_file_path(&cache_file_path)
            .with_fetch_interval(Duration::from_secs(3600));

        let (agent, _responses_rx) = Agent::new(config).await.unwrap();
        assert!(agent.router.find_route("GET", "/person/5").is_some());

        // Rewrite the cache file directly, well inside the 300s
        // cache_duration the fetched config just set. The watcher must
        // still reparse: a WRITE is a definitive change signal, not subject
        // to the ticker's freshness gate.
        std::fs::write(
            &cache_file_path,
            r#"{"parent_org_id":"org-1","base_url":"https://collector.example","events_path":"/events","cache_duration":300,"target":[],"sample":[{"method":"GET","path":"/person/:id"}]}"#,
        )
        .unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if agent.router.find_route("GET", "/person/5").is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reloaded.is_ok(), "cache file write should have triggered a reparse despite the freshness gate");

        // The route is now SAMPLE, already recorded by the reload itself, so
        // a subsequent request against it is classified as already-sampled.
        assert_eq!(agent.router.classify("GET", "/person/9", "/person/:id"), None);

        agent.shutdown().await;
    }

    #[test]
    fn agent_config_requires_both_env_vars() {
        std::env::remove_var("AUDITR_CONFIG_URL");
        std::env::remove_var("AUDITR_API_KEY");
        std::env::remove_var("ENV_PATH");
        assert!(AgentConfig::from_env().is_err());
    }
}
