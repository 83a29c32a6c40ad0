//! In-memory routing table.
//!
//! Routes are held in store order (oldest first) and the first route whose
//! prefix matches the request path wins. A prefix matches on a segment
//! boundary: `/api` matches `/api` and `/api/users` but not `/apix`.

use std::sync::RwLock;

use http::Uri;
use tracing::{debug, warn};
use uuid::Uuid;

use nimbus_state::GatewayRoute;

/// Parsed `target_url` of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `host:port` to connect to.
    pub authority: String,
    /// Path prefix on the upstream, without a trailing slash.
    pub base_path: String,
}

impl Upstream {
    /// Parse an `http://host[:port][/base]` URL.
    pub fn parse(target_url: &str) -> Result<Self, String> {
        let uri: Uri = target_url
            .parse()
            .map_err(|e| format!("invalid target url `{target_url}`: {e}"))?;
        if uri.scheme_str() != Some("http") {
            return Err(format!("target url `{target_url}` must use http://"));
        }
        let host = uri.host().ok_or_else(|| format!("target url `{target_url}` has no host"))?;
        let port = uri.port_u16().unwrap_or(80);
        Ok(Self {
            authority: format!("{host}:{port}"),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }
}

/// The outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route_id: Uuid,
    pub upstream: Upstream,
    /// Path and query to request from the upstream.
    pub path_and_query: String,
    pub rewrite_host: bool,
}

struct Entry {
    route: GatewayRoute,
    upstream: Upstream,
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Default)]
pub struct RouteTable {
    entries: RwLock<Vec<Entry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new route set. Routes with unusable targets are skipped.
    pub fn replace(&self, routes: Vec<GatewayRoute>) {
        let entries: Vec<Entry> = routes
            .into_iter()
            .filter_map(|route| match Upstream::parse(&route.target_url) {
                Ok(upstream) => Some(Entry { route, upstream }),
                Err(e) => {
                    warn!(route_id = %route.id, error = %e, "skipping route");
                    None
                }
            })
            .collect();
        debug!(routes = entries.len(), "gateway routing table refreshed");
        *self.entries.write().expect("routes lock") = entries;
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("routes lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn route(&self, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let entries = self.entries.read().expect("routes lock");
        let entry = entries.iter().find(|e| prefix_matches(&e.route.path_prefix, path))?;

        let remainder = if entry.route.strip_prefix {
            let prefix = entry.route.path_prefix.trim_end_matches('/');
            let rest = &path[prefix.len()..];
            if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") }
        } else {
            path.to_string()
        };
        let mut path_and_query = format!("{}{remainder}", entry.upstream.base_path);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }

        Some(RouteMatch {
            route_id: entry.route.id,
            upstream: entry.upstream.clone(),
            path_and_query,
            rewrite_host: entry.route.rewrite_host,
        })
    }
}
