//! Event Builder: assembles the wire-shape
//! audit record from an envelope, a classified route, and raw
//! response/error bytes.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::envelope::Envelope;
use crate::error::BuildError;
use crate::extractor;
use crate::route::{Route, RouteType};

#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRoute {
    #[serde(rename = "type")]
    pub route_type: RouteType,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Client {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// The wire-shape audit record. One of these is produced per
/// classified request and handed to the publisher (C6).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub organization: Organization,
    pub route: EventRoute,
    pub user: User,
    pub client: Client,
    pub requested_at: i64,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl Event {
    /// This event's identity string, used only to pick a batch bucket.
    /// Chosen as org id + route + second-bucketed request time: stable for
    /// the same logical request, distinct enough across requests to spread
    /// load over `maxConcurrentBatches`.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.organization.id,
            self.route.method,
            self.route.path,
            self.requested_at / 1000
        )
    }
}

/// Inputs to an [`EventBuilder`]; borrowed for the duration of one build
/// call, never stored.
pub struct BuildContext<'a> {
    pub parent_org_id: &'a str,
    pub org_id_field: &'a str,
    pub route_type: RouteType,
    pub route: &'a Route,
    pub envelope: &'a Envelope,
    pub response_bytes: &'a [u8],
    pub error_bytes: Option<&'a [u8]>,
}

/// A builder for one envelope variant. Builders are tried in registration
/// order by [`build_event`]; a builder whose envelope variant doesn't match
/// fails with [`BuildError::WrongEnvelope`] so the next one is tried.
pub trait EventBuilder: Send + Sync {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<Event, BuildError>;
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn bytes_to_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn build_common(ctx: &BuildContext<'_>) -> Event {
    let fields = ctx.envelope.fields();

    let org_id = if !ctx.org_id_field.is_empty() {
        extractor::extract(fields, ctx.org_id_field).unwrap_or_else(|_| ctx.parent_org_id.to_string())
    } else {
        ctx.parent_org_id.to_string()
    };

    let user = User {
        id: extractor::extract(fields, "request.header.x-user-id").ok(),
        email: extractor::extract(fields, "request.body.email").ok(),
        name: extractor::extract(fields, "request.querystring.username").ok(),
        full_name: None,
        domain: None,
    };

    let ip = extractor::extract(fields, "request.header.x-forwarded-for")
        .ok()
        .or_else(|| fields.remote_ip());

    let requested_at = fields.requested_at_override_ms().unwrap_or_else(now_epoch_ms);

    Event {
        organization: Organization { id: org_id },
        route: EventRoute {
            route_type: ctx.route_type,
            method: ctx.route.method.clone(),
            path: ctx.route.path.clone(),
        },
        user,
        client: Client { ip },
        requested_at,
        request: serde_json::to_value(ctx.envelope).unwrap_or(serde_json::Value::Null),
        response: bytes_to_json(ctx.response_bytes),
        error: ctx.error_bytes.map(bytes_to_json),
    }
}

/// Builder for plain `http::Request`-backed envelopes.
pub struct HttpEventBuilder;

impl EventBuilder for HttpEventBuilder {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<Event, BuildError> {
        match ctx.envelope {
            Envelope::Http(_) => Ok(build_common(ctx)),
            _ => Err(BuildError::WrongEnvelope),
        }
    }
}

/// Builder for AWS API Gateway proxy-integration envelopes.
pub struct ApiGatewayEventBuilder;

impl EventBuilder for ApiGatewayEventBuilder {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<Event, BuildError> {
        match ctx.envelope {
            Envelope::ApiGatewayProxy(_) => Ok(build_common(ctx)),
            _ => Err(BuildError::WrongEnvelope),
        }
    }
}

/// The default builder chain: tries the plain-HTTP shape, then the
/// API-gateway proxy shape.
pub fn default_builders() -> Vec<Box<dyn EventBuilder>> {
    vec![Box::new(HttpEventBuilder), Box::new(ApiGatewayEventBuilder)]
}

/// Runs `ctx` through `builders` in order, returning the first success. If
/// every builder rejects the envelope variant, returns
/// [`BuildError::WrongEnvelope`] (the publisher then emits a synthesized
/// error response).
pub fn build_event(builders: &[Box<dyn EventBuilder>], ctx: &BuildContext<'_>) -> Result<Event, BuildError> {
    for builder in builders {
        match builder.build(ctx) {
            Ok(event) => return Ok(event),
            Err(BuildError::WrongEnvelope) => continue,
        }
    }
    Err(BuildError::WrongEnvelope)
}
