//! Per-method router built on two independent [`PathTree`] families: one for
//! TARGET routes (always audited, configured up front) and one for SAMPLE
//! routes (configured, or discovered lazily and recorded so the next
//! request on the same template is suppressed).
//!
//! Reconfiguration swaps both families atomically via [`ArcSwap`], the
//! same hot-path-read / cold-path-write split a listener table wants when
//! reads vastly outnumber reconfigurations.

use std::collections::HashMap;

use arc_swap::ArcSwap;

use crate::error::RouteError;

use super::{PathTree, Route, RouteType};

/// AWS API Gateway's greedy-proxy resource marker. A route registered under
/// this template matches everything beneath it, so treating a match against
/// it as a discovered SAMPLE route would record one sample entry per
/// distinct path ever seen — defeating the point of sampling. Matches
/// against it are suppressed rather than recorded.
const PROXY_SENTINEL: &str = "{proxy+}";

fn normalize_method(method: &str) -> Result<String, RouteError> {
    if method.trim().is_empty() {
        return Err(RouteError::EmptyMethod);
    }
    Ok(method.to_ascii_uppercase())
}

#[derive(Default)]
struct Trees {
    target: HashMap<String, PathTree<String>>,
    sample: HashMap<String, PathTree<String>>,
}

/// Classifies inbound requests against TARGET and SAMPLE route sets.
///
/// Cheap to clone (wraps an `Arc`-backed swap); intended to be shared behind
/// an `Arc<Router>` between the middleware's request path and the
/// configurer's reload path.
pub struct Router {
    trees: ArcSwap<Trees>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            trees: ArcSwap::from_pointee(Trees::default()),
        }
    }

    /// Replaces the TARGET and SAMPLE route sets wholesale. Routes that fail
    /// to register (conflicting wildcard, empty path, relative path, empty
    /// method) are skipped and reported to the caller rather than aborting
    /// the reload: a route error never aborts the process.
    pub fn configure(
        &self,
        target_routes: &[Route],
        sample_routes: &[Route],
    ) -> Vec<(Route, RouteError)> {
        let mut trees = Trees::default();
        let mut failures = Vec::new();

        for route in target_routes {
            if let Err(err) = Self::insert(&mut trees.target, route) {
                failures.push((route.clone(), err));
            }
        }
        for route in sample_routes {
            if let Err(err) = Self::insert(&mut trees.sample, route) {
                failures.push((route.clone(), err));
            }
        }

        self.trees.store(std::sync::Arc::new(trees));
        failures
    }

    fn insert(
        trees: &mut HashMap<String, PathTree<String>>,
        route: &Route,
    ) -> Result<(), RouteError> {
        let method = normalize_method(&route.method)?;
        let tree = trees.entry(method).or_insert_with(PathTree::new);
        tree.insert(&route.path, route.path.clone())
    }

    /// Finds a TARGET route matching `method`/`path`. TARGET routes are
    /// always audited, never suppressed.
    pub fn find_route(&self, method: &str, path: &str) -> Option<Route> {
        self.lookup(RouteType::Target, method, path)
    }

    /// Runs the full classification protocol for one request: TARGET is tried first and always wins; a SAMPLE hit means this
    /// route was already recorded and is suppressed (`None`); a miss on
    /// both records the route via [`Self::sample_route`] and returns it so
    /// exactly one event is emitted for the first-ever occurrence.
    pub fn classify(&self, method: &str, path: &str, resource_template: &str) -> Option<(RouteType, Route)> {
        if let Some(route) = self.find_route(method, path) {
            return Some((RouteType::Target, route));
        }
        if self.lookup(RouteType::Sample, method, path).is_some() {
            return None;
        }
        self.sample_route(method, path, resource_template)
            .map(|route| (RouteType::Sample, route))
    }

    fn lookup(&self, kind: RouteType, method: &str, path: &str) -> Option<Route> {
        let method = normalize_method(method).ok()?;
        let trees = self.trees.load();
        let family = match kind {
            RouteType::Target => &trees.target,
            RouteType::Sample => &trees.sample,
        };
        let tree = family.get(&method)?;
        let (template, _params) = tree.lookup(path);
        template.map(|t| Route::new(method, t.clone()))
    }

    /// Finds or lazily records a SAMPLE route. `resource_template` is the
    /// application's own view of which resource this request belongs to
    /// (e.g. an axum/actix route template); it is used only to decide
    /// whether to skip recording (the `{proxy+}` sentinel) — the tree still
    /// stores and matches on the literal request path the first time it is
    /// seen, then matches the same template on every later request.
    ///
    /// Returns `None` when the route is suppressed by the sentinel, when the
    /// method is empty, or when a concurrent caller already recorded this
    /// template (a race against [`Self::classify`]'s own SAMPLE check) — in
    /// every case this stays a one-shot emission, never a re-emission.
    pub fn sample_route(
        &self,
        method: &str,
        path: &str,
        resource_template: &str,
    ) -> Option<Route> {
        if resource_template.contains(PROXY_SENTINEL) {
            return None;
        }
        let method = normalize_method(method).ok()?;
        let template = rewrite_resource_template(resource_template);
        let trees = self.trees.load();
        if let Some(tree) = trees.sample.get(&method) {
            if tree.lookup(path).0.is_some() {
                return None;
            }
        }
        drop(trees);

        // First sighting: record the template so subsequent matches on it
        // are suppressed, then hand back this one occurrence to be audited.
        let mut next = Trees::default();
        {
            let current = self.trees.load();
            for (m, tree) in &current.target {
                next.target.insert(m.clone(), tree.clone());
            }
            for (m, tree) in &current.sample {
                next.sample.insert(m.clone(), tree.clone());
            }
        }
        let tree = next.sample.entry(method.clone()).or_insert_with(PathTree::new);
        if tree.insert(&template, template.clone()).is_err() {
            return None;
        }
        self.trees.store(std::sync::Arc::new(next));
        tracing::debug!(method = %method, path = %template, "first sighting of sample route recorded");
        Some(Route::new(method, template))
    }
}

/// Rewrites `{name}`-style template parameters (the shape most host routers
/// — Gorilla mux, API Gateway resources — surface) to this crate's `:name`
/// form before insertion into the tree.
fn rewrite_resource_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start + 1..];
        match rest.find('}') {
            Some(end) => {
                out.push(':');
                out.push_str(&rest[..end]);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('{');
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_route_is_always_found() {
        let router = Router::new();
        router.configure(&[Route::new("GET", "/person/:id")], &[]);
        assert_eq!(
            router.find_route("get", "/person/5"),
            Some(Route::new("GET", "/person/:id"))
        );
    }

    #[test]
    fn unconfigured_method_misses() {
        let router = Router::new();
        router.configure(&[Route::new("GET", "/person/:id")], &[]);
        assert_eq!(router.find_route("POST", "/person/5"), None);
    }

    #[test]
    fn sample_route_is_recorded_on_first_sighting_only() {
        let router = Router::new();
        router.configure(&[], &[]);
        let first = router.sample_route("GET", "/widgets/7", "/widgets/:id");
        assert_eq!(first, Some(Route::new("GET", "/widgets/:id")));

        // A second direct call against the same template is treated as a
        // race against the first insert and suppressed, not re-emitted.
        let second = router.sample_route("GET", "/widgets/9", "/widgets/:id");
        assert_eq!(second, None);
    }

    #[test]
    fn classify_emits_sample_once_then_suppresses() {
        let router = Router::new();
        let first = router.classify("GET", "/person/5", "/person/:id");
        assert_eq!(first, Some((RouteType::Sample, Route::new("GET", "/person/:id"))));

        let second = router.classify("GET", "/person/9", "/person/:id");
        assert_eq!(second, None, "same template, different concrete path, already sampled");
    }

    #[test]
    fn classify_prefers_target_over_sample() {
        let router = Router::new();
        router.configure(&[Route::new("GET", "/person/:id")], &[]);
        assert_eq!(
            router.classify("GET", "/person/5", "/person/:id"),
            Some((RouteType::Target, Route::new("GET", "/person/:id")))
        );
    }

    #[test]
    fn classify_suppresses_proxy_sentinel() {
        let router = Router::new();
        assert_eq!(router.classify("GET", "/anything/here", "/{proxy+}"), None);
        assert_eq!(router.classify("GET", "/anything/else", "/{proxy+}"), None);
    }

    #[test]
    fn brace_style_resource_template_is_rewritten() {
        let router = Router::new();
        let route = router.sample_route("GET", "/person/42", "/person/{id}");
        assert_eq!(route, Some(Route::new("GET", "/person/:id")));
    }

    #[test]
    fn proxy_sentinel_is_never_sampled() {
        let router = Router::new();
        let result = router.sample_route("GET", "/anything/here", "/{proxy+}");
        assert_eq!(result, None);
    }

    #[test]
    fn empty_method_misses_rather_than_panics() {
        let router = Router::new();
        router.configure(&[Route::new("GET", "/a")], &[]);
        assert_eq!(router.find_route("", "/a"), None);
    }

    #[test]
    fn reconfigure_replaces_previous_routes() {
        let router = Router::new();
        router.configure(&[Route::new("GET", "/a")], &[]);
        assert!(router.find_route("GET", "/a").is_some());
        router.configure(&[Route::new("GET", "/b")], &[]);
        assert!(router.find_route("GET", "/a").is_none());
        assert!(router.find_route("GET", "/b").is_some());
    }

    #[test]
    fn configure_reports_conflicting_routes_without_aborting() {
        let router = Router::new();
        let failures = router.configure(
            &[Route::new("GET", "/files/:id"), Route::new("GET", "/files/*rest")],
            &[],
        );
        assert_eq!(failures.len(), 1);
        assert!(router.find_route("GET", "/files/5").is_some());
    }
}
