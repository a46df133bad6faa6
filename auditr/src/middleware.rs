//! Middleware: a `tower::Layer`/`tower::Service`
//! pair that wraps a host handler, snapshots the request/response into an
//! [`HttpEnvelope`], classifies it against the configured routes, and
//! dispatches an audit event — without altering what the host's handler
//! actually sees or sends.
//!
//! Wraps an inner service, does work around the call, and returns the
//! inner response untouched, built on `tower::Service` so it composes
//! directly into an `axum::Router::layer(...)` or any other tower-based
//! stack.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use tower_layer::Layer;
use tower_service::Service;

use auditr_core::envelope::{Envelope, HttpEnvelope, RemoteAddress, Url, MAX_CAPTURED_BODY_BYTES};
use auditr_core::route::Router;
use auditr_services::Publisher;

/// Resolves the host router's own path template for a request (e.g. an
/// axum `MatchedPath` extension, a Gorilla-mux-style lookup). Returning
/// `None` falls back to the raw request path.
pub type ResourceTemplateFn = Arc<dyn Fn(&http::request::Parts) -> Option<String> + Send + Sync>;

/// Builds [`AuditService`] around a host handler. Cheap to clone: every
/// field is an `Arc`.
#[derive(Clone)]
pub struct AuditLayer {
    router: Arc<Router>,
    publisher: Arc<Publisher>,
    resource_template: Option<ResourceTemplateFn>,
}

impl AuditLayer {
    pub fn new(router: Arc<Router>, publisher: Arc<Publisher>) -> Self {
        AuditLayer {
            router,
            publisher,
            resource_template: None,
        }
    }

    /// Registers a host-specific resource-template resolver. Without one,
    /// the raw request path doubles as the template, which is always
    /// correct for TARGET routes (configured literally) but defeats
    /// SAMPLE's parameter generalization for hosts that don't supply their
    /// own path-template extension.
    pub fn with_resource_template(
        mut self,
        resolver: impl Fn(&http::request::Parts) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.resource_template = Some(Arc::new(resolver));
        self
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditService {
            inner,
            router: self.router.clone(),
            publisher: self.publisher.clone(),
            resource_template: self.resource_template.clone(),
        }
    }
}

/// The wrapped service. Buffers both bodies fully (the pragmatic
/// non-streaming equivalent of the `CopyWriter` tee in a buffered-body
/// world) so the forwarded request/response are bit-for-bit what the host
/// would otherwise have seen, while a truncated copy feeds the audit event.
pub struct AuditService<S> {
    inner: S,
    router: Arc<Router>,
    publisher: Arc<Publisher>,
    resource_template: Option<ResourceTemplateFn>,
}

impl<S: Clone> Clone for AuditService<S> {
    fn clone(&self) -> Self {
        AuditService {
            inner: self.inner.clone(),
            router: self.router.clone(),
            publisher: self.publisher.clone(),
            resource_template: self.resource_template.clone(),
        }
    }
}

impl<S, ReqBody, RespBody> Service<Request<ReqBody>> for AuditService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<RespBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    ReqBody: http_body::Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: std::fmt::Display,
    RespBody: http_body::Body<Data = Bytes> + Send + 'static,
    RespBody::Error: std::fmt::Display,
{
    type Response = Response<Full<Bytes>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Standard tower clone-and-swap: the ready clone captured here runs
        // the request, `self.inner` is left holding the spare for the next
        // `poll_ready`/`call` pair.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let router = self.router.clone();
        let publisher = self.publisher.clone();
        let resource_template_fn = self.resource_template.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let request_bytes = collect_body(body, "request").await;
            let captured_request = truncate(&request_bytes, MAX_CAPTURED_BODY_BYTES);

            let envelope = build_http_envelope(&parts, captured_request, resource_template_fn.as_deref());
            let method = parts.method.as_str().to_string();
            let path = parts.uri.path().to_string();
            let resource_template = envelope.matched_path.clone().unwrap_or_else(|| path.clone());

            let forwarded = Request::from_parts(parts, Full::new(request_bytes));
            let response = match inner.call(forwarded).await {
                Ok(response) => response,
                Err(err) => {
                    // The wrapped service itself failed (e.g. a Lambda-style
                    // handler returning an error rather than a response).
                    // There is no response body to audit, but the event's
                    // `error` field exists for exactly this case; record it
                    // and propagate the error to the host unaltered.
                    if let Some((route_type, route)) = router.classify(&method, &path, &resource_template) {
                        let envelope = Envelope::Http(envelope);
                        let error_bytes = serde_json::to_vec(&err.to_string()).unwrap_or_default();
                        tokio::spawn(async move {
                            publisher.publish(route_type, &route, &envelope, b"", Some(&error_bytes)).await;
                        });
                    }
                    return Err(err);
                }
            };

            let (resp_parts, resp_body) = response.into_parts();
            let response_bytes = collect_body(resp_body, "response").await;
            let captured_response = truncate(&response_bytes, MAX_CAPTURED_BODY_BYTES);

            if let Some((route_type, route)) = router.classify(&method, &path, &resource_template) {
                let envelope = Envelope::Http(envelope);
                tokio::spawn(async move {
                    publisher.publish(route_type, &route, &envelope, &captured_response, None).await;
                });
            }

            Ok(Response::from_parts(resp_parts, Full::new(response_bytes)))
        })
    }
}

async fn collect_body<B>(body: B, which: &'static str) -> Bytes
where
    B: http_body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!(error = %err, which, "failed to buffer body for audit capture");
            Bytes::new()
        }
    }
}

fn truncate(bytes: &Bytes, limit: usize) -> Bytes {
    if bytes.len() > limit {
        bytes.slice(0..limit)
    } else {
        bytes.clone()
    }
}

fn build_http_envelope(
    parts: &http::request::Parts,
    captured_body: Bytes,
    resource_template_fn: Option<&ResourceTemplateFn>,
) -> HttpEnvelope {
    let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default()
        .to_string();
    let url = Url {
        scheme,
        host,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
    };

    let mut envelope = HttpEnvelope::new(parts.method.as_str(), url, captured_body);
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            envelope = envelope.with_header(name.as_str(), value);
        }
    }

    if !parts.headers.contains_key("x-forwarded-for") {
        if let Some(addr) = parts.extensions.get::<SocketAddr>() {
            envelope = envelope
                .with_header("Remote-Address-Ip", addr.ip().to_string())
                .with_header("Remote-Address-Port", addr.port().to_string());
            envelope.remote_address = RemoteAddress {
                ip: addr.ip().to_string(),
                port: addr.port(),
            };
        }
    }

    let template = resource_template_fn
        .and_then(|resolve| resolve(parts))
        .unwrap_or_else(|| parts.uri.path().to_string());
    envelope.with_matched_path(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditr_core::config::Configuration;
    use auditr_core::route::Route;
    use auditr_services::PublisherConfig;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use wiremock::matchers::method as method_matcher;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Clone)]
    struct Echo;

    impl Service<Request<Full<Bytes>>> for Echo {
        type Response = Response<Full<Bytes>>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Full<Bytes>>) -> Self::Future {
            std::future::ready(Ok(Response::builder()
                .status(200)
                .body(Full::new(Bytes::from_static(b"{\"ok\":true}")))
                .unwrap()))
        }
    }

    #[derive(Clone)]
    struct Failing;

    impl Service<Request<Full<Bytes>>> for Failing {
        type Response = Response<Full<Bytes>>;
        type Error = String;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Full<Bytes>>) -> Self::Future {
            std::future::ready(Err("handler blew up".to_string()))
        }
    }

    fn publisher_config(events_url: String) -> PublisherConfig {
        let defaults = Configuration::default();
        PublisherConfig {
            parent_org_id: "org-1".into(),
            org_id_field: String::new(),
            events_url,
            api_key: "key".into(),
            max_events_per_batch: defaults.max_events_per_batch,
            max_concurrent_batches: defaults.max_concurrent_batches,
            pending_work_capacity: defaults.pending_work_capacity,
            send_interval: Duration::from_millis(20),
            block_on_send: true,
            block_on_response: true,
            flush_after_each_event: false,
        }
    }

    #[tokio::test]
    async fn wraps_handler_and_returns_its_response_unaltered() {
        let server = MockServer::start().await;
        Mock::given(method_matcher("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(publisher_config(server.uri()), auditr_core::event::default_builders(), reqwest::Client::new(), tx);
        let router = Arc::new(Router::new());
        router.configure(&[Route::new("GET", "/ping")], &[]);

        let layer = AuditLayer::new(router, publisher);
        let service = layer.layer(Echo);

        let request = Request::builder()
            .method("GET")
            .uri("http://example.com/ping")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"ok\":true}");

        let audit = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(audit.status, Some(200));
    }

    #[tokio::test]
    async fn second_request_on_same_template_is_not_resampled() {
        let server = MockServer::start().await;
        Mock::given(method_matcher("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let publisher = Publisher::new(publisher_config(server.uri()), auditr_core::event::default_builders(), reqwest::Client::new(), tx);
        let router = Arc::new(Router::new());

        let layer = AuditLayer::new(router, publisher).with_resource_template(|parts| {
            parts.uri.path().starts_with("/person/").then(|| "/person/{id}".to_string())
        });
        let service = layer.layer(Echo);

        let first = Request::builder()
            .method("GET")
            .uri("http://example.com/person/5")
            .body(Full::new(Bytes::new()))
            .unwrap();
        service.clone().oneshot(first).await.unwrap();
        let first_event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(first_event.is_some(), "first sighting of this template should emit a sample event");

        let second = Request::builder()
            .method("GET")
            .uri("http://example.com/person/9")
            .body(Full::new(Bytes::new()))
            .unwrap();
        service.oneshot(second).await.unwrap();
        let second_event = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second_event.is_err(), "same template already sampled, second occurrence must be suppressed");
    }

    #[tokio::test]
    async fn handler_error_is_audited_and_still_propagated_to_host() {
        let server = MockServer::start().await;
        Mock::given(method_matcher("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": 200}])))
            .mount(&server)
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let publisher = Publisher::new(publisher_config(server.uri()), auditr_core::event::default_builders(), reqwest::Client::new(), tx);
        let router = Arc::new(Router::new());
        router.configure(&[Route::new("GET", "/ping")], &[]);

        let layer = AuditLayer::new(router, publisher);
        let service = layer.layer(Failing);

        let request = Request::builder()
            .method("GET")
            .uri("http://example.com/ping")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = service.oneshot(request).await.unwrap_err();
        assert_eq!(err, "handler blew up");

        // The audited POST is fired from a detached task, give it a moment
        // to land before inspecting what the collector actually received.
        let posted = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let requests = server.received_requests().await.unwrap();
                if !requests.is_empty() {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("audit POST for the failed handler should still be sent");

        let body: serde_json::Value = posted[0].body_json().unwrap();
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["error"].as_str().unwrap(), "handler blew up");
    }
}
