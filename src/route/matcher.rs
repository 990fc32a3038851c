/**
 * Copyright (c) 2024-2025 Glaive, Inc.
 *
 * This file is part of Glaive Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Two-pass route matching: first narrow to routes whose host/path/method
//! constraints are satisfied, then pick the most specific survivor (routes
//! are pre-sorted by specificity so the first match wins).

use crate::config::graph::{RouteEntry, RoutingGraph};

/// `localhost`/`127.0.0.1`/`[::1]` are treated as interchangeable for host
/// matching, so `localhost`/`127.0.0.1`/`[::1]` are interchangeable in dev.
fn hosts_equivalent(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    const LOOPBACK_ALIASES: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];
    LOOPBACK_ALIASES.contains(&a) && LOOPBACK_ALIASES.contains(&b)
}

/// Splits `host[:port]` into its host and port parts. IPv6 literals
/// (`[::1]:8080`) keep their brackets as part of the host.
pub fn split_host_port(s: &str) -> (&str, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => {
                let host = &s[..end + 2];
                let port = s[end + 2..].strip_prefix(':').and_then(|p| p.parse().ok());
                (host, port)
            }
            None => (s, None),
        };
    }
    match s.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (s, None),
        },
        None => (s, None),
    }
}

fn ends_with_dot_suffix_ci(actual: &str, suffix: &str) -> bool {
    if actual.len() <= suffix.len() {
        return false;
    }
    let split = actual.len() - suffix.len();
    actual.as_bytes()[split - 1] == b'.' && actual[split..].eq_ignore_ascii_case(suffix)
}

/// Wildcard `*.suffix` matches any label sequence ending in `.suffix` or the
/// bare `suffix` itself. A pattern with an explicit port only matches a host
/// carrying that same port.
fn host_matches(pattern: &str, actual: &str) -> bool {
    let (pattern_host, pattern_port) = split_host_port(pattern);
    let (actual_host, actual_port) = split_host_port(actual);
    if let Some(pp) = pattern_port {
        if actual_port != Some(pp) {
            return false;
        }
    }
    if let Some(suffix) = pattern_host.strip_prefix("*.") {
        return actual_host.eq_ignore_ascii_case(suffix) || ends_with_dot_suffix_ci(actual_host, suffix);
    }
    hosts_equivalent(pattern_host, actual_host)
}

fn path_matches(pattern: &str, actual: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        actual.starts_with(prefix)
    } else {
        pattern == actual
    }
}

/// Finds the most specific route matching `host`/`path`/`method`, scanning
/// `graph.ordered_routes()` (already sorted most-specific-first) and
/// returning the first full match.
pub fn find_route<'a>(
    graph: &'a RoutingGraph,
    host: &str,
    path: &str,
    method: &str,
) -> Option<&'a RouteEntry> {
    graph.ordered_routes().into_iter().find(|route| {
        let host_ok = route.hosts.is_empty() || route.hosts.iter().any(|h| host_matches(h, host));
        let path_ok = path_matches(&route.path, path);
        let method_ok = route
            .method
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case(method))
            .unwrap_or(true);
        host_ok && path_ok && method_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::graph::RouteEntry;
    use std::collections::HashMap;

    fn route(id: &str, hosts: &[&str], path: &str, specificity: u32) -> RouteEntry {
        RouteEntry {
            id: id.to_string(),
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            path: path.to_string(),
            method: None,
            cluster_id: None,
            metadata: HashMap::new(),
            specificity,
        }
    }

    fn graph(routes: Vec<RouteEntry>) -> RoutingGraph {
        let mut g = RoutingGraph::default();
        g.routes = routes;
        g
    }

    #[test]
    fn exact_path_wins_over_wildcard() {
        let g = graph(vec![
            route("wild", &[], "/api/*", 1),
            route("exact", &[], "/api/users", 2),
        ]);
        let found = find_route(&g, "example.com", "/api/users", "GET").unwrap();
        assert_eq!(found.id, "exact");
    }

    #[test]
    fn host_wildcard_matches_subdomain() {
        let g = graph(vec![route("wild-host", &["*.example.com"], "/*", 1)]);
        let found = find_route(&g, "api.example.com", "/ping", "GET").unwrap();
        assert_eq!(found.id, "wild-host");
    }

    #[test]
    fn host_wildcard_matches_bare_suffix() {
        let g = graph(vec![route("wild-host", &["*.example.com"], "/*", 1)]);
        let found = find_route(&g, "example.com", "/ping", "GET").unwrap();
        assert_eq!(found.id, "wild-host");
    }

    #[test]
    fn explicit_port_in_host_must_match() {
        let g = graph(vec![route("on-8443", &["example.com:8443"], "/*", 1)]);
        assert!(find_route(&g, "example.com:8443", "/", "GET").is_some());
        assert!(find_route(&g, "example.com:9000", "/", "GET").is_none());
        assert!(find_route(&g, "example.com", "/", "GET").is_none());
    }

    #[test]
    fn host_without_port_matches_any_port() {
        let g = graph(vec![route("any-port", &["example.com"], "/*", 1)]);
        assert!(find_route(&g, "example.com:8443", "/", "GET").is_some());
        assert!(find_route(&g, "example.com", "/", "GET").is_some());
    }

    #[test]
    fn loopback_aliases_are_interchangeable() {
        let g = graph(vec![route("local", &["localhost"], "/*", 1)]);
        assert!(find_route(&g, "127.0.0.1", "/", "GET").is_some());
    }

    #[test]
    fn method_constraint_is_respected() {
        let mut r = route("post-only", &[], "/submit", 1);
        r.method = Some("POST".to_string());
        let g = graph(vec![r]);
        assert!(find_route(&g, "example.com", "/submit", "GET").is_none());
        assert!(find_route(&g, "example.com", "/submit", "POST").is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let g = graph(vec![route("only", &["example.com"], "/only", 1)]);
        assert!(find_route(&g, "other.com", "/only", "GET").is_none());
    }
}
