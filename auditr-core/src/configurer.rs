//! Configurer: parses the configuration
//! document, gates re-fetches behind a freshness window, and fans the
//! freshly parsed [`Configuration`] out to subscribers in registration
//! order. Deliberately synchronous and I/O-free — the byte provider it is
//! constructed with is an injected closure, usually
//! [`crate::util::file_read_sync`] over the cache file; the
//! periodic remote fetch and the cache-file filesystem watch that decide
//! *when* to call [`Configurer::refresh`] are I/O concerns that live in
//! `auditr-services::fetcher` instead (see `DESIGN.md`).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::Configuration;
use crate::error::{AnyError, ConfigError};

/// Supplies the raw configuration bytes a [`Configurer::refresh`] parses.
/// Boxed rather than generic so `Configurer` stays object-safety-free to use
/// without turning every call site into a type parameter.
pub type ByteProvider = Box<dyn Fn() -> Result<Vec<u8>, AnyError> + Send + Sync>;

type Subscriber = Box<dyn Fn(&Arc<Configuration>) + Send + Sync>;

/// Owns the live [`Configuration`] and the subscriber list that is notified
/// on every successful reparse.
pub struct Configurer {
    current: Mutex<Arc<Configuration>>,
    last_refreshed: Mutex<Instant>,
    provider: ByteProvider,
    subscribers: Mutex<Vec<Subscriber>>,
    configured_tx: watch::Sender<Arc<Configuration>>,
}

impl Configurer {
    /// Constructs a Configurer seeded with `initial` (typically
    /// [`Configuration::default`] or whatever was last cached), pulling
    /// fresh bytes through `provider` whenever [`Self::refresh`] decides the
    /// current configuration is stale.
    pub fn new(initial: Configuration, provider: ByteProvider) -> Self {
        let initial = Arc::new(initial);
        let (configured_tx, _rx) = watch::channel(initial.clone());
        Configurer {
            current: Mutex::new(initial),
            // Far enough in the past that the very first `refresh` call
            // always passes the freshness gate.
            last_refreshed: Mutex::new(Instant::now() - Duration::from_secs(3600 * 24 * 365)),
            provider,
            subscribers: Mutex::new(Vec::new()),
            configured_tx,
        }
    }

    /// Returns the live configuration snapshot. Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<Configuration> {
        self.current.lock().unwrap().clone()
    }

    /// Registers `subscriber`, invoked once per successful reparse in
    /// registration order. There is no unregister: subscribers live for the
    /// lifetime of the Configurer.
    pub fn on_refresh(&self, subscriber: impl Fn(&Arc<Configuration>) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(subscriber));
    }

    /// A `tokio::sync::watch` view of the current configuration, updated
    /// after every successful reparse.
    pub fn configured(&self) -> watch::Receiver<Arc<Configuration>> {
        self.configured_tx.subscribe()
    }

    /// Triggers an immediate reparse if the freshness gate allows it:
    /// a no-op (returning `Ok(false)`) when `now - lastRefreshed <
    /// cacheDuration` of the *current* configuration. Otherwise invokes the
    /// byte provider, parses, and on success atomically replaces the live
    /// configuration and notifies `configured()` and every subscriber in
    /// order. A parse or provider failure leaves the previous configuration
    /// untouched and surfaces [`ConfigError`].
    pub fn refresh(&self) -> Result<bool, ConfigError> {
        let cache_duration = self.current().cache_duration;
        {
            let last_refreshed = self.last_refreshed.lock().unwrap();
            if last_refreshed.elapsed() < cache_duration {
                return Ok(false);
            }
        }

        let bytes = (self.provider)().map_err(ConfigError::Provider)?;
        let config = Arc::new(Configuration::parse(&bytes)?);

        *self.current.lock().unwrap() = config.clone();
        *self.last_refreshed.lock().unwrap() = Instant::now();

        tracing::info!(
            target_routes = config.target_routes.len(),
            sample_routes = config.sample_routes.len(),
            "audit configuration reloaded"
        );
        let _ = self.configured_tx.send(config.clone());
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&config);
        }
        Ok(true)
    }

    /// Forces a reparse regardless of the freshness gate. Used by
    /// `Agent::from_env`'s initial bootstrap and by tests.
    pub fn force_refresh(&self) -> Result<(), ConfigError> {
        *self.last_refreshed.lock().unwrap() = Instant::now() - Duration::from_secs(3600 * 24 * 365);
        self.refresh().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn configurer_with(json: &'static [u8]) -> Configurer {
        Configurer::new(Configuration::default(), Box::new(move || Ok(json.to_vec())))
    }

    #[test]
    fn force_refresh_parses_and_updates_current() {
        let configurer = configurer_with(br#"{"parent_org_id": "org-1"}"#);
        configurer.force_refresh().unwrap();
        assert_eq!(configurer.current().parent_org_id, "org-1");
    }

    #[test]
    fn freshness_gate_skips_refetch_within_cache_duration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let configurer = Configurer::new(
            Configuration::default(),
            Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(br#"{"cache_duration": 3600}"#.to_vec())
            }),
        );
        assert!(configurer.refresh().unwrap());
        assert!(!configurer.refresh().unwrap(), "second refresh should be a no-op");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_are_invoked_in_registration_order() {
        let configurer = configurer_with(br#"{"parent_org_id": "org-1"}"#);
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        configurer.on_refresh(move |_| a.lock().unwrap().push("a"));
        configurer.on_refresh(move |_| b.lock().unwrap().push("b"));
        configurer.force_refresh().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn bad_config_json_leaves_previous_configuration_unchanged() {
        let configurer = configurer_with(br#"not json"#);
        assert!(configurer.force_refresh().is_err());
        assert_eq!(configurer.current().parent_org_id, "");
    }

    #[test]
    fn configured_channel_emits_after_reparse() {
        let configurer = configurer_with(br#"{"parent_org_id": "org-2"}"#);
        let mut rx = configurer.configured();
        configurer.force_refresh().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().parent_org_id, "org-2");
    }
}
