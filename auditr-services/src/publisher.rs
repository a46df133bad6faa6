//! Publisher: the bounded queue, fixed worker
//! pool, and timeout-or-size flush trigger sitting between the middleware
//! (C9) and the batch accumulator (C5).

use std::sync::Arc;
use std::time::Duration;

use auditr_core::envelope::Envelope;
use auditr_core::event::{build_event, BuildContext, Event, EventBuilder};
use auditr_core::route::{Route, RouteType};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::batch::{BatchList, Response, ResponseSink};
use crate::error::PublishError;

/// Everything the publisher needs that the Configurer (C7) can change on a
/// reload. Captured by value into each worker at spawn time — a
/// reconfiguration takes effect for the *next* batch, never an in-flight
/// one.
#[derive(Clone)]
pub struct PublisherConfig {
    pub parent_org_id: String,
    pub org_id_field: String,
    pub events_url: String,
    pub api_key: String,
    pub max_events_per_batch: u32,
    pub max_concurrent_batches: u32,
    pub pending_work_capacity: u32,
    pub send_interval: Duration,
    pub block_on_send: bool,
    pub block_on_response: bool,
    /// When set, every [`Publisher::publish`] call is followed by a
    /// [`Publisher::flush`], trading batching
    /// efficiency for immediate delivery.
    pub flush_after_each_event: bool,
}

struct Inner {
    config: PublisherConfig,
    work_tx: mpsc::Sender<Event>,
    worker_handles: Vec<JoinHandle<()>>,
}

/// Queue (single producer channel), worker pool, timeout-or-size flush,
/// flush-on-demand.
pub struct Publisher {
    builders: Vec<Box<dyn EventBuilder>>,
    http_client: reqwest::Client,
    responses_tx: mpsc::Sender<Response>,
    inner: RwLock<Inner>,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        builders: Vec<Box<dyn EventBuilder>>,
        http_client: reqwest::Client,
        responses_tx: mpsc::Sender<Response>,
    ) -> Arc<Self> {
        let (work_tx, worker_handles) = spawn_workers(&config, &http_client, &responses_tx);
        Arc::new(Publisher {
            builders,
            http_client,
            responses_tx,
            inner: RwLock::new(Inner {
                config,
                work_tx,
                worker_handles,
            }),
        })
    }

    /// Builds the event (trying each registered builder in turn) and
    /// submits it to the pending-work channel, honoring `blockOnSend`. A
    /// non-blocking enqueue failure, and builder exhaustion, both surface
    /// only on the response channel.
    pub async fn publish(
        &self,
        route_type: RouteType,
        route: &Route,
        envelope: &Envelope,
        response_bytes: &[u8],
        error_bytes: Option<&[u8]>,
    ) {
        let (org_id_field, parent_org_id, block_on_send, flush_after_each_event) = {
            let inner = self.inner.read().await;
            (
                inner.config.org_id_field.clone(),
                inner.config.parent_org_id.clone(),
                inner.config.block_on_send,
                inner.config.flush_after_each_event,
            )
        };
        let route_owned = route.clone();
        let ctx = BuildContext {
            parent_org_id: &parent_org_id,
            org_id_field: &org_id_field,
            route_type,
            route: &route_owned,
            envelope,
            response_bytes,
            error_bytes,
        };
        let event = match build_event(&self.builders, &ctx) {
            Ok(event) => event,
            Err(err) => {
                self.emit(Response {
                    status: None,
                    error: Some(PublishError::WrongEnvelope(err).to_string()),
                })
                .await;
                return;
            }
        };

        {
            let inner = self.inner.read().await;
            if block_on_send {
                let _ = inner.work_tx.send(event).await;
            } else if inner.work_tx.try_send(event).is_err() {
                drop(inner);
                self.emit(Response {
                    status: None,
                    error: Some(PublishError::QueueOverflow.to_string()),
                })
                .await;
                return;
            }
        }

        if flush_after_each_event {
            self.flush().await;
        }
    }

    async fn emit(&self, response: Response) {
        let block_on_response = self.inner.read().await.config.block_on_response;
        ResponseSink::new(self.responses_tx.clone(), block_on_response)
            .emit(response)
            .await;
    }

    /// Applies a configuration change. Held for the next worker pool spawn
    /// (the next explicit or implicit [`Self::flush`]); does not affect
    /// workers already running.
    pub async fn reconfigure(&self, config: PublisherConfig) {
        self.inner.write().await.config = config;
    }

    /// Stops the current worker pool (draining in-flight batches as a side
    /// effect of the old workers seeing their channel close), starts a
    /// fresh one from the current configuration, and atomically swaps
    /// under a write lock. Enqueuers hold only a read lock, so a flush
    /// waits for outstanding enqueues but not for outstanding sends.
    pub async fn flush(&self) {
        let old_handles = {
            let mut inner = self.inner.write().await;
            let (new_tx, new_handles) = spawn_workers(&inner.config, &self.http_client, &self.responses_tx);
            let old_handles = std::mem::replace(&mut inner.worker_handles, new_handles);
            let old_tx = std::mem::replace(&mut inner.work_tx, new_tx);
            drop(old_tx);
            old_handles
        };
        for handle in old_handles {
            let _ = handle.await;
        }
    }

    /// Terminal shutdown: stops workers and does not start a replacement
    /// pool. Used by the composition root's own shutdown path.
    pub async fn shutdown(&self) {
        let old_handles = {
            let mut inner = self.inner.write().await;
            let old_tx = std::mem::replace(&mut inner.work_tx, mpsc::channel(1).0);
            drop(old_tx);
            std::mem::take(&mut inner.worker_handles)
        };
        for handle in old_handles {
            let _ = handle.await;
        }
    }
}

fn spawn_workers(
    config: &PublisherConfig,
    http_client: &reqwest::Client,
    responses_tx: &mpsc::Sender<Response>,
) -> (mpsc::Sender<Event>, Vec<JoinHandle<()>>) {
    let capacity = config.pending_work_capacity.max(1) as usize;
    let (tx, rx) = mpsc::channel(capacity);
    let rx = Arc::new(Mutex::new(rx));
    let worker_count = config.max_concurrent_batches.max(1);
    let mut handles = Vec::with_capacity(worker_count as usize);
    for _ in 0..worker_count {
        let rx = rx.clone();
        let events_url = config.events_url.clone();
        let api_key = config.api_key.clone();
        let client = http_client.clone();
        let max_concurrent_batches = config.max_concurrent_batches;
        let max_events_per_batch = config.max_events_per_batch;
        let send_interval = config.send_interval;
        let responses = ResponseSink::new(responses_tx.clone(), config.block_on_response);
        handles.push(tokio::spawn(async move {
            worker_loop(
                rx,
                events_url,
                api_key,
                client,
                max_concurrent_batches,
                max_events_per_batch,
                send_interval,
                responses,
            )
            .await;
        }));
    }
    (tx, handles)
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    events_url: String,
    api_key: String,
    client: reqwest::Client,
    max_concurrent_batches: u32,
    max_events_per_batch: u32,
    send_interval: Duration,
    responses: ResponseSink,
) {
    let mut batch = BatchList::new(
        events_url,
        api_key,
        client,
        max_concurrent_batches,
        max_events_per_batch,
        responses,
    );
    // A sentinel far enough in the future that it never naturally elapses;
    // reset to `now + send_interval` the moment the batch's first event
    // lands.
    let mut deadline = Instant::now() + Duration::from_secs(365 * 24 * 3600);

    loop {
        let recv = async {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        tokio::select! {
            received = recv => {
                match received {
                    Some(event) => {
                        if batch.is_empty() {
                            deadline = Instant::now() + send_interval;
                        }
                        batch.add(event);
                        if batch.len() as u32 >= max_events_per_batch {
                            batch.fire().await;
                            deadline = Instant::now() + Duration::from_secs(365 * 24 * 3600);
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            batch.fire().await;
                        }
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if !batch.is_empty() {
                    batch.fire().await;
                    deadline = Instant::now() + Duration::from_secs(365 * 24 * 3600);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditr_core::envelope::{HttpEnvelope, Url};
    use auditr_core::event::default_builders;
    use bytes::Bytes;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(events_url: String) -> PublisherConfig {
        PublisherConfig {
            parent_org_id: "org-1".into(),
            org_id_field: String::new(),
            events_url,
            api_key: "key".into(),
            max_events_per_batch: 10,
            max_concurrent_batches: 1,
            pending_work_capacity: 1,
            send_interval: Duration::from_millis(50),
            block_on_send: false,
            block_on_response: true,
            flush_after_each_event: false,
        }
    }

    fn envelope() -> Envelope {
        Envelope::Http(HttpEnvelope::new(
            "GET",
            Url {
                scheme: "https".into(),
                host: "example.com".into(),
                path: "/ping".into(),
                query: String::new(),
            },
            Bytes::new(),
        ))
    }

    #[tokio::test]
    async fn publish_flushes_on_timeout_and_emits_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(config(server.uri()), default_builders(), reqwest::Client::new(), tx);
        let route = Route::new("GET", "/ping");
        publisher
            .publish(RouteType::Target, &route, &envelope(), b"{}", None)
            .await;

        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("response channel should yield before timeout")
            .unwrap();
        assert_eq!(response.status, Some(200));
    }

    #[tokio::test]
    async fn queue_overflow_is_reported_when_non_blocking() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.pending_work_capacity = 1;
        cfg.send_interval = Duration::from_secs(60);
        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(cfg, default_builders(), reqwest::Client::new(), tx);
        let route = Route::new("GET", "/ping");

        for _ in 0..4 {
            publisher
                .publish(RouteType::Target, &route, &envelope(), b"{}", None)
                .await;
        }

        let mut saw_overflow = false;
        while let Ok(Some(response)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            if response.error.as_deref() == Some("queue overflow") {
                saw_overflow = true;
                break;
            }
        }
        assert!(saw_overflow, "expected at least one queue-overflow response");
    }

    #[tokio::test]
    async fn flush_drains_in_flight_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.send_interval = Duration::from_secs(60);
        cfg.pending_work_capacity = 4;
        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(cfg, default_builders(), reqwest::Client::new(), tx);
        let route = Route::new("GET", "/ping");
        publisher
            .publish(RouteType::Target, &route, &envelope(), b"{}", None)
            .await;

        publisher.flush().await;

        let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("flush should have drained the pending event")
            .unwrap();
        assert_eq!(response.status, Some(200));
    }

    #[tokio::test]
    async fn flush_after_each_event_delivers_without_waiting_for_send_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.send_interval = Duration::from_secs(3600);
        cfg.max_events_per_batch = 10;
        cfg.flush_after_each_event = true;
        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(cfg, default_builders(), reqwest::Client::new(), tx);
        let route = Route::new("GET", "/ping");
        publisher
            .publish(RouteType::Target, &route, &envelope(), b"{}", None)
            .await;

        let response = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("flush_after_each_event should deliver without waiting for send_interval or batch size")
            .unwrap();
        assert_eq!(response.status, Some(200));
    }
}
