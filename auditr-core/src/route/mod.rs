//! Route classification: the parameterized-path radix tree ([`tree`]) and the
//! per-method router built on top of it ([`router`]).

pub mod router;
pub mod tree;

pub use router::Router;
pub use tree::PathTree;

/// One of the two classifications a [`Router`] can assign a request to.
///
/// TARGET routes come from configuration and are always audited; SAMPLE
/// routes are either configured or discovered the first time they are seen,
/// then suppressed on every subsequent match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Target,
    Sample,
}

/// A classified route: the HTTP method and the path template it matched.
///
/// Two routes are equal iff method and template are equal.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub method: String,
    pub path: String,
}

impl Route {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Route {
            method: method.into(),
            path: path.into(),
        }
    }
}
