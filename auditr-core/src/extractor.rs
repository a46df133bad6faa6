//! Field Extractor: evaluates
//! `request.<source>.<key>` field paths against a captured envelope.

use crate::envelope::EnvelopeFields;
use crate::error::ExtractError;

enum Source {
    Header,
    Querystring,
    Body,
}

fn parse_source(s: &str) -> Option<Source> {
    match s {
        "header" => Some(Source::Header),
        "querystring" => Some(Source::Querystring),
        "body" => Some(Source::Body),
        _ => None,
    }
}

/// Evaluates `field_path` (`request.<source>.<key>`) against `envelope`.
///
/// Malformed paths — fewer than three dot-segments, or an unrecognized
/// `<source>` — fail with [`ExtractError::BadField`]. A well-formed path
/// whose value is absent fails with [`ExtractError::FieldAbsent`]. Pure:
/// allocates only the returned `String`.
pub fn extract(envelope: &dyn EnvelopeFields, field_path: &str) -> Result<String, ExtractError> {
    let mut parts = field_path.splitn(3, '.');
    let (root, source, key) = match (parts.next(), parts.next(), parts.next()) {
        (Some(root), Some(source), Some(key)) => (root, source, key),
        _ => return Err(ExtractError::BadField(field_path.to_string())),
    };
    if root != "request" {
        return Err(ExtractError::BadField(field_path.to_string()));
    }
    let source = parse_source(source).ok_or_else(|| ExtractError::BadField(field_path.to_string()))?;
    match source {
        Source::Header => extract_header(envelope, key),
        Source::Querystring => extract_querystring(envelope, key),
        Source::Body => extract_body(envelope, key),
    }
}

fn extract_header(envelope: &dyn EnvelopeFields, name: &str) -> Result<String, ExtractError> {
    // Reserved for future JWT-claims decoding; currently always absent.
    if name.to_ascii_lowercase().ends_with(".jwt") {
        return Err(ExtractError::FieldAbsent(name.to_string()));
    }
    match envelope.header(name) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ExtractError::FieldAbsent(name.to_string())),
    }
}

fn extract_querystring(envelope: &dyn EnvelopeFields, name: &str) -> Result<String, ExtractError> {
    match envelope.querystring(name) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ExtractError::FieldAbsent(name.to_string())),
    }
}

fn extract_body(envelope: &dyn EnvelopeFields, path: &str) -> Result<String, ExtractError> {
    let body = envelope.body_bytes();
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ExtractError::FieldAbsent(path.to_string()))?;
    let found = walk_json_path(&value, path).ok_or_else(|| ExtractError::FieldAbsent(path.to_string()))?;
    value_to_string(found).ok_or_else(|| ExtractError::FieldAbsent(path.to_string()))
}

enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits a dotted JSON path (`a.b[0].c`) into key/index segments.
fn split_path_segments(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for token in path.split('.') {
        let mut rest = token;
        match rest.find('[') {
            None => segments.push(PathSegment::Key(rest.to_string())),
            Some(bracket_pos) => {
                let key = &rest[..bracket_pos];
                if !key.is_empty() {
                    segments.push(PathSegment::Key(key.to_string()));
                }
                rest = &rest[bracket_pos..];
                while let Some(stripped) = rest.strip_prefix('[') {
                    let Some(end) = stripped.find(']') else { break };
                    if let Ok(idx) = stripped[..end].parse::<usize>() {
                        segments.push(PathSegment::Index(idx));
                    }
                    rest = &stripped[end + 1..];
                }
            }
        }
    }
    segments
}

fn walk_json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in split_path_segments(path) {
        current = match segment {
            PathSegment::Key(k) => current.as_object()?.get(&k)?,
            PathSegment::Index(i) => current.as_array()?.get(i)?,
        };
    }
    Some(current)
}

/// Numeric-to-string coercion on leaf values; object/array
/// leaves and JSON null are not valid extraction results.
fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
