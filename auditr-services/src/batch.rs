//! Batch List: the per-flush-period
//! accumulator each publisher worker owns exclusively. Groups events by a hash
//! of their identity into buckets, encodes each bucket to a JSON POST body
//! subject to per-event and per-batch size limits, sends it, and drains
//! whatever didn't fit into an overflow map.

use std::collections::HashMap;

use auditr_core::config::{MAX_EVENT_BYTES, MAX_OVERFLOW_ROUNDS, OVERFLOW_BUCKET_WIDTH};
use auditr_core::event::Event;
use auditr_core::util::hash::{bucket_id, fingerprint};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::PublishError;

/// One element of the response channel the caller (C6/C9) reads from —
/// either a per-event outcome from a successful collector reply, or a
/// synthesized local failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Option<i64>,
    pub error: Option<String>,
}

impl Response {
    fn error(message: impl Into<String>) -> Self {
        Response {
            status: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServerResponseItem {
    status: i64,
    #[serde(default)]
    error: Option<String>,
}

/// Writes to the response channel honoring `blockOnResponse`: block until read, or drop silently on a full channel.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<Response>,
    block_on_response: bool,
}

impl ResponseSink {
    pub fn new(tx: mpsc::Sender<Response>, block_on_response: bool) -> Self {
        ResponseSink { tx, block_on_response }
    }

    pub async fn emit(&self, response: Response) {
        if self.block_on_response {
            let _ = self.tx.send(response).await;
        } else {
            let _ = self.tx.try_send(response);
        }
    }
}

/// Per-worker batch accumulator. Owns exactly one in-flight bucket map at a
/// time; workers never share a `BatchList`.
pub struct BatchList {
    buckets: HashMap<usize, Vec<Event>>,
    max_concurrent_batches: u32,
    max_events_per_batch: u32,
    events_url: String,
    api_key: String,
    http_client: reqwest::Client,
    responses: ResponseSink,
}

impl BatchList {
    pub fn new(
        events_url: String,
        api_key: String,
        http_client: reqwest::Client,
        max_concurrent_batches: u32,
        max_events_per_batch: u32,
        responses: ResponseSink,
    ) -> Self {
        BatchList {
            buckets: HashMap::new(),
            max_concurrent_batches,
            max_events_per_batch,
            events_url,
            api_key,
            http_client,
            responses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Adds `event` to its bucket, keyed by a hash of the event's identity
    /// mod `maxConcurrentBatches`.
    pub fn add(&mut self, event: Event) {
        let bucket = bucket_id(fingerprint(&event.identity()), self.max_concurrent_batches as usize);
        self.buckets.entry(bucket).or_default().push(event);
    }

    /// Terminal operation: encodes, sends, and drains overflow for every
    /// bucket accumulated since the last fire. Invoked by the worker when a
    /// batch period ends.
    pub async fn fire(&mut self) {
        let buckets = std::mem::take(&mut self.buckets);
        let mut overflow: HashMap<usize, Vec<Event>> = HashMap::new();

        for events in buckets.into_values() {
            let (payload, remainder) =
                encode_and_split(events, self.max_events_per_batch, &self.responses).await;
            for event in remainder {
                let bucket = bucket_id(fingerprint(&event.identity()), OVERFLOW_BUCKET_WIDTH);
                overflow.entry(bucket).or_default().push(event);
            }
            self.send(payload).await;
        }

        self.drain_overflow(overflow).await;
    }

    /// Bounded overflow drain: each round snapshots the
    /// overflow keys, clears each entry before sending so further overflow
    /// starts a fresh entry, and stops silently after
    /// [`MAX_OVERFLOW_ROUNDS`] regardless of whether the map is empty.
    async fn drain_overflow(&self, mut overflow: HashMap<usize, Vec<Event>>) {
        let mut round = 0;
        while !overflow.is_empty() && round < MAX_OVERFLOW_ROUNDS {
            let keys: Vec<usize> = overflow.keys().copied().collect();
            let mut next_overflow: HashMap<usize, Vec<Event>> = HashMap::new();
            for key in keys {
                let Some(events) = overflow.remove(&key) else { continue };
                let (payload, remainder) =
                    encode_and_split(events, self.max_events_per_batch, &self.responses).await;
                for event in remainder {
                    let bucket = bucket_id(fingerprint(&event.identity()), OVERFLOW_BUCKET_WIDTH);
                    next_overflow.entry(bucket).or_default().push(event);
                }
                self.send(payload).await;
            }
            overflow = next_overflow;
            round += 1;
        }
    }

    /// POSTs `payload` (already-encoded JSON values). Retries once on
    /// transport error with a fresh request; a second failure emits one
    /// error `Response` per event. A non-2xx status emits one `Response`
    /// per event (and logs the body once on 400). A 2xx body is a JSON
    /// array of `{status, error?}`, emitted in order.
    async fn send(&self, payload: Vec<serde_json::Value>) {
        if payload.is_empty() {
            return;
        }
        let body = serde_json::Value::Array(payload.clone());

        let mut result = self.post_once(&body).await;
        if result.is_err() {
            result = self.post_once(&body).await;
        }

        match result {
            Err(err) => {
                tracing::warn!(error = %err, "audit batch send failed after retry");
                for _ in 0..payload.len() {
                    self.responses
                        .emit(Response::error(PublishError::HttpTransport(err.clone()).to_string()))
                        .await;
                }
            }
            Ok(resp) => {
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 400 {
                        tracing::warn!(body = %body, "audit batch rejected with 400");
                    }
                    for _ in 0..payload.len() {
                        self.responses
                            .emit(Response {
                                status: Some(status.as_u16() as i64),
                                error: Some(
                                    PublishError::HttpStatus {
                                        status: status.as_u16(),
                                        body: text.clone(),
                                    }
                                    .to_string(),
                                ),
                            })
                            .await;
                    }
                } else {
                    match resp.json::<Vec<ServerResponseItem>>().await {
                        Ok(items) => {
                            for item in items {
                                self.responses
                                    .emit(Response {
                                        status: Some(item.status),
                                        error: item.error,
                                    })
                                    .await;
                            }
                        }
                        Err(err) => {
                            self.responses.emit(Response::error(format!("failed to decode collector response: {err}"))).await;
                        }
                    }
                }
            }
        }
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<reqwest::Response, String> {
        self.http_client
            .post(&self.events_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::USER_AGENT,
                format!("auditr-agent/{}", env!("CARGO_PKG_VERSION")),
            )
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| err.to_string())
    }
}

/// Encodes `events` to JSON in order, applying the per-event rules and returning the encodable prefix plus whatever had to be shed
/// to overflow (either dropped events, on encode/size failure, reported via
/// `responses`; or the batch-ceiling-exceeding suffix, returned verbatim).
async fn encode_and_split(
    events: Vec<Event>,
    max_events_per_batch: u32,
    responses: &ResponseSink,
) -> (Vec<serde_json::Value>, Vec<Event>) {
    let ceiling = max_events_per_batch as usize * MAX_EVENT_BYTES;
    let mut payload = Vec::new();
    let mut running_size = 0usize;
    let mut iter = events.into_iter();

    while let Some(event) = iter.next() {
        let json = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(err) => {
                responses
                    .emit(Response::error(PublishError::Encode(err.to_string()).to_string()))
                    .await;
                continue;
            }
        };
        let size = serde_json::to_vec(&json).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > MAX_EVENT_BYTES {
            responses
                .emit(Response::error(PublishError::EventTooLarge(MAX_EVENT_BYTES).to_string()))
                .await;
            continue;
        }
        if running_size + size > ceiling {
            let mut remainder = vec![event];
            remainder.extend(iter);
            return (payload, remainder);
        }
        running_size += size;
        payload.push(json);
    }

    (payload, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditr_core::envelope::{Envelope, HttpEnvelope, Url};
    use auditr_core::event::{build_event, default_builders, BuildContext};
    use auditr_core::route::{Route, RouteType};
    use bytes::Bytes;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_event(path_value: &str) -> Event {
        let envelope = Envelope::Http(HttpEnvelope::new(
            "GET",
            Url {
                scheme: "https".into(),
                host: "example.com".into(),
                path: path_value.into(),
                query: String::new(),
            },
            Bytes::new(),
        ));
        let route = Route::new("GET", path_value);
        let ctx = BuildContext {
            parent_org_id: "org-1",
            org_id_field: "",
            route_type: RouteType::Target,
            route: &route,
            envelope: &envelope,
            response_bytes: b"{}",
            error_bytes: None,
        };
        build_event(&default_builders(), &ctx).unwrap()
    }

    #[tokio::test]
    async fn successful_send_emits_one_response_per_array_element() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"status": 200},
                {"status": 200},
            ])))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let mut batch = BatchList::new(
            format!("{}/events", server.uri()),
            "key".into(),
            reqwest::Client::new(),
            1,
            10,
            ResponseSink::new(tx, true),
        );
        batch.add(test_event("/a"));
        batch.add(test_event("/b"));
        batch.fire().await;

        let mut responses = Vec::new();
        while let Ok(r) = rx.try_recv() {
            responses.push(r);
        }
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.status == Some(200)));
    }

    #[tokio::test]
    async fn transport_failure_emits_one_response_per_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut batch = BatchList::new(
            "http://127.0.0.1:0/events".into(),
            "key".into(),
            reqwest::Client::new(),
            1,
            10,
            ResponseSink::new(tx, true),
        );
        batch.add(test_event("/a"));
        batch.fire().await;

        let response = rx.recv().await.unwrap();
        assert!(response.error.is_some());
        assert!(response.status.is_none());
    }

    #[tokio::test]
    async fn oversized_event_is_dropped_with_one_response() {
        let (tx, mut rx) = mpsc::channel(16);
        let responses = ResponseSink::new(tx, true);
        let mut event = test_event("/huge");
        event.request = serde_json::json!({ "padding": "x".repeat(30_000) });
        let (payload, remainder) = encode_and_split(vec![event], 10, &responses).await;
        assert!(payload.is_empty());
        assert!(remainder.is_empty());
        let response = rx.recv().await.unwrap();
        assert!(response.error.unwrap().contains("exceeds max size"));
    }

    #[tokio::test]
    async fn batch_ceiling_overflow_returns_remainder() {
        let (tx, _rx) = mpsc::channel(16);
        let responses = ResponseSink::new(tx, false);
        let events: Vec<Event> = (0..11)
            .map(|i| {
                let mut e = test_event(&format!("/r{i}"));
                e.request = serde_json::json!({ "padding": "x".repeat(24_500) });
                e
            })
            .collect();
        let (payload, remainder) = encode_and_split(events, 10, &responses).await;
        assert_eq!(payload.len(), 10);
        assert_eq!(remainder.len(), 1);
    }
}
