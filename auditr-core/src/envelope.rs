//! Framework-neutral HTTP envelope and the API-gateway
//! proxy-event variant the Event Builder (C4) must also accept.
//!
//! `HttpEnvelope` is what the middleware (C9) snapshots directly off a
//! `http::Request`/`http::Response`. `ApiGatewayProxyEnvelope` models the
//! AWS API Gateway "proxy integration" event shape a Lambda-hosted handler
//! sees instead of a live socket — both implement [`EnvelopeFields`] so the
//! field extractor (C3) and event builders (C4) can stay agnostic of which
//! one they were handed.

use bytes::Bytes;
use serde::Serialize;

/// Case-insensitive, order-preserving, multi-valued header store.
///
/// A plain `HashMap<String, String>` would lose casing and later-duplicate
/// values; headers are looked up case-insensitively but
/// serialized under their original casing, first-seen-wins on duplicates.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

impl Serialize for Headers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut seen = std::collections::HashSet::new();
        let mut map = serializer.serialize_map(None)?;
        for (k, v) in &self.0 {
            let lower = k.to_ascii_lowercase();
            if seen.insert(lower) {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}

/// Order-preserving, first-value-wins query string parameters.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        QueryParams(Vec::new())
    }

    /// Parses a `a=1&b=2` query string. Percent-decoding is deliberately not
    /// performed here: callers (the middleware) hand us the decoded pairs
    /// their HTTP library already parsed; this constructor exists for tests
    /// and for hosts that only expose the raw query string.
    pub fn parse(query: &str) -> Self {
        let mut params = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let mut it = pair.splitn(2, '=');
            let key = it.next().unwrap_or_default();
            let value = it.next().unwrap_or_default();
            params.push((key.to_string(), value.to_string()));
        }
        QueryParams(params)
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

impl Serialize for QueryParams {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut seen = std::collections::HashSet::new();
        let mut map = serializer.serialize_map(None)?;
        for (k, v) in &self.0 {
            if seen.insert(k.clone()) {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteAddress {
    pub ip: String,
    pub port: u16,
}

/// Common surface the field extractor (C3) and event builders (C4) need,
/// independent of which concrete envelope variant is in play.
pub trait EnvelopeFields {
    fn method(&self) -> &str;
    fn header(&self, name: &str) -> Option<&str>;
    fn querystring(&self, name: &str) -> Option<&str>;
    fn body_bytes(&self) -> &[u8];
    fn remote_ip(&self) -> Option<String>;
    fn matched_path(&self) -> Option<&str>;
    fn requested_at_override_ms(&self) -> Option<i64>;
}

/// Maximum request/response body size retained by the middleware's capture
/// buffer; bodies larger than this are truncated at read.
pub const MAX_CAPTURED_BODY_BYTES: usize = 100 * 1024;

/// A normalized snapshot of a plain HTTP request, independent of any
/// specific HTTP framework.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpEnvelope {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    #[serde(serialize_with = "serialize_body_lossy")]
    pub body: Bytes,
    pub remote_address: RemoteAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_at_ms: Option<i64>,
    #[serde(skip)]
    query_params: QueryParams,
}

fn serialize_body_lossy<S>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl HttpEnvelope {
    pub fn new(method: impl Into<String>, url: Url, body: Bytes) -> Self {
        let query_params = QueryParams::parse(&url.query);
        HttpEnvelope {
            method: method.into(),
            url,
            headers: Headers::new(),
            body,
            remote_address: RemoteAddress::default(),
            matched_path: None,
            requested_at_ms: None,
            query_params,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_matched_path(mut self, path: impl Into<String>) -> Self {
        self.matched_path = Some(path.into());
        self
    }
}

impl EnvelopeFields for HttpEnvelope {
    fn method(&self) -> &str {
        &self.method
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    fn querystring(&self, name: &str) -> Option<&str> {
        self.query_params.get(name)
    }

    fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    fn remote_ip(&self) -> Option<String> {
        if self.remote_address.ip.is_empty() {
            None
        } else {
            Some(self.remote_address.ip.clone())
        }
    }

    fn matched_path(&self) -> Option<&str> {
        self.matched_path.as_deref()
    }

    fn requested_at_override_ms(&self) -> Option<i64> {
        self.requested_at_ms
    }
}

/// AWS API Gateway "proxy integration" event shape: the other envelope
/// variant event builders must tolerate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiGatewayProxyEnvelope {
    pub http_method: String,
    pub path: String,
    /// The API Gateway resource path, e.g. `/person/{id}` or `/{proxy+}`.
    pub resource: String,
    pub headers: Headers,
    pub query_string_parameters: QueryParams,
    #[serde(serialize_with = "serialize_body_lossy")]
    pub body: Bytes,
    pub source_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_time_epoch_ms: Option<i64>,
}

impl EnvelopeFields for ApiGatewayProxyEnvelope {
    fn method(&self) -> &str {
        &self.http_method
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    fn querystring(&self, name: &str) -> Option<&str> {
        self.query_string_parameters.get(name)
    }

    fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    fn remote_ip(&self) -> Option<String> {
        if self.source_ip.is_empty() {
            None
        } else {
            Some(self.source_ip.clone())
        }
    }

    fn matched_path(&self) -> Option<&str> {
        if self.resource.is_empty() {
            None
        } else {
            Some(&self.resource)
        }
    }

    fn requested_at_override_ms(&self) -> Option<i64> {
        self.request_time_epoch_ms
    }
}

/// The envelope variants an [`crate::event::EventBuilder`] may receive.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Http(HttpEnvelope),
    ApiGatewayProxy(ApiGatewayProxyEnvelope),
}

impl Envelope {
    pub fn fields(&self) -> &dyn EnvelopeFields {
        match self {
            Envelope::Http(e) => e,
            Envelope::ApiGatewayProxy(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.push("X-User-Id", "abc");
        assert_eq!(headers.get("x-user-id"), Some("abc"));
    }

    #[test]
    fn query_params_first_value_wins() {
        let q = QueryParams::parse("a=1&a=2&b=3");
        assert_eq!(q.get("a"), Some("1"));
        assert_eq!(q.get("b"), Some("3"));
        assert_eq!(q.get("c"), None);
    }

    #[test]
    fn http_envelope_serializes_body_lossily() {
        let envelope = HttpEnvelope::new(
            "GET",
            Url {
                scheme: "https".into(),
                host: "example.com".into(),
                path: "/ping".into(),
                query: String::new(),
            },
            Bytes::from_static(b"{\"a\":1}"),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["body"], serde_json::json!("{\"a\":1}"));
        assert_eq!(value["method"], serde_json::json!("GET"));
    }

    #[test]
    fn api_gateway_envelope_exposes_resource_as_matched_path() {
        let envelope = ApiGatewayProxyEnvelope {
            http_method: "GET".into(),
            path: "/person/42".into(),
            resource: "/person/{id}".into(),
            ..Default::default()
        };
        assert_eq!(envelope.matched_path(), Some("/person/{id}"));
    }
}
