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

//! Turns a [`RawConfig`] (however it was produced — `serde_yaml` or the DSL
//! parse tree via [`node_to_raw_config`]) into a [`RoutingGraph`]: listens
//! are deduplicated by `(host, port)` with TLS-conflict detection, routes get
//! a specificity score for ordering, clusters are deduplicated by content,
//! and file-server/canned-response items get synthetic ids when the source
//! format didn't assign one.

use std::collections::HashMap;

use crate::config::dsl::{Node, Value};
use crate::config::graph::{ClusterEntry, Listener, ListenerKind, RoutingGraph};
use crate::config::model::{
    GeoMode, HealthPredicateKind, LbPolicy, PathRule, RawAccessControl, RawCertEntry, RawCluster,
    RawConfig, RawConnectionLimit, RawDestination, RawFileServerItem, RawForwardProxyConfig,
    RawGeoControl, RawHealthCheck, RawHttpClient, RawListener, RawRateLimiter, RawRoute,
    RawRouteMatch, RawSimpleResItem, RawStreamConfig, RawWaf, RateLimiterKind, StreamPolicy,
};
use crate::errors::{GatewayError, GatewayResult};

/// Reserved id for the synthetic "black hole" cluster: a route may point here
/// explicitly to mean "match, but serve nothing" without tripping the
/// unresolved-cluster check.
pub const RESERVED_UNUSED_CLUSTER: &str = "cluster_unused";

pub fn normalize(raw: RawConfig) -> GatewayResult<RoutingGraph> {
    let listeners = normalize_listeners(&raw.listens)?;
    let (clusters, cluster_remap) = normalize_clusters(raw.clusters)?;
    let routes = normalize_routes(raw.routes, &clusters, &cluster_remap)?;
    let file_server_items = index_file_server_items(raw.file_server_items);
    let simple_res_items = index_simple_res_items(raw.simple_res_items);
    let rate_limiters = raw
        .rate_limiters
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();
    let streams = raw
        .streams
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    let forward_proxies = raw
        .forward_proxies
        .into_iter()
        .map(|f| (f.port, f))
        .collect();

    Ok(RoutingGraph {
        listeners,
        certificates: raw.certificates,
        routes,
        clusters,
        file_server_items,
        simple_res_items,
        access_control: raw.access_control,
        waf: raw.waf,
        rate_limiters,
        streams,
        forward_proxies,
        control_plane_addr: raw.control_plane_addr,
        cc_limits: raw.cc_limits,
    })
}

fn normalize_listeners(raw: &[RawListener]) -> GatewayResult<Vec<Listener>> {
    let mut seen: HashMap<(String, u16), bool> = HashMap::new();
    let mut out = Vec::with_capacity(raw.len());
    for l in raw {
        if l.port <= 0 || l.port > u16::MAX as i64 {
            return Err(GatewayError::ConfigConflict(format!(
                "listener {}:{} has an invalid port",
                l.host, l.port
            )));
        }
        let port = l.port as u16;
        let key = (l.host.clone(), port);
        if let Some(existing_tls) = seen.get(&key) {
            if *existing_tls != l.tls {
                return Err(GatewayError::ConfigConflict(format!(
                    "listener {}:{} declared with conflicting TLS settings",
                    l.host, port
                )));
            }
            continue;
        }
        seen.insert(key, l.tls);

        let kind = if l.forward_proxy {
            ListenerKind::ForwardProxy
        } else if let Some(stream_name) = &l.stream {
            ListenerKind::Stream(stream_name.clone())
        } else {
            ListenerKind::Http
        };

        out.push(Listener {
            host: l.host.clone(),
            port,
            tls: l.tls,
            auto_https_port: l.auto_https_port,
            kind,
        });
    }
    Ok(out)
}

/// Canonical content key for cluster de-duplication: destination set
/// (sorted, so declaration order doesn't matter) plus LB policy. Two
/// clusters with the same key are the same cluster as far as routing is
/// concerned and get coalesced into one, keeping whichever id was seen
/// first.
fn cluster_content_key(cluster: &RawCluster) -> (Vec<(String, String, u32)>, LbPolicy) {
    let mut destinations: Vec<(String, String, u32)> = cluster
        .destinations
        .iter()
        .map(|d| (d.id.clone(), d.address.clone(), d.weight))
        .collect();
    destinations.sort();
    (destinations, cluster.lb_policy)
}

/// Builds the id -> canonical-id remap table for coalesced clusters and
/// always emits the reserved `cluster_unused` sentinel so routes that point
/// at it (static/respond handlers with no real upstream) resolve without a
/// special case in the caller. Returns the deduplicated cluster map plus a
/// remap from every original declared id to the id that actually survived.
fn normalize_clusters(raw: Vec<RawCluster>) -> GatewayResult<(HashMap<String, ClusterEntry>, HashMap<String, String>)> {
    let mut out: HashMap<String, ClusterEntry> = HashMap::with_capacity(raw.len());
    let mut content_index: HashMap<(Vec<(String, String, u32)>, LbPolicy), String> = HashMap::new();
    let mut remap: HashMap<String, String> = HashMap::new();
    let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::with_capacity(raw.len());

    for cluster in raw {
        if !seen_ids.insert(cluster.id.clone()) {
            return Err(GatewayError::ConfigConflict(format!(
                "duplicate cluster id '{}'",
                cluster.id
            )));
        }
        let key = cluster_content_key(&cluster);
        if let Some(canonical_id) = content_index.get(&key) {
            remap.insert(cluster.id.clone(), canonical_id.clone());
            continue;
        }
        content_index.insert(key, cluster.id.clone());
        out.insert(
            cluster.id.clone(),
            ClusterEntry {
                id: cluster.id.clone(),
                raw: cluster,
            },
        );
    }

    out.entry(RESERVED_UNUSED_CLUSTER.to_string()).or_insert_with(|| ClusterEntry {
        id: RESERVED_UNUSED_CLUSTER.to_string(),
        raw: RawCluster {
            id: RESERVED_UNUSED_CLUSTER.to_string(),
            destinations: vec![RawDestination {
                id: "unused".to_string(),
                address: "0.0.0.0:0".to_string(),
                weight: 1,
                metadata: HashMap::new(),
            }],
            lb_policy: LbPolicy::First,
            health_check: None,
            http_client: RawHttpClient::default(),
            hash_key: None,
        },
    });

    Ok((out, remap))
}

fn normalize_routes(
    raw: Vec<RawRoute>,
    clusters: &HashMap<String, ClusterEntry>,
    cluster_remap: &HashMap<String, String>,
) -> GatewayResult<Vec<crate::config::graph::RouteEntry>> {
    let mut out = Vec::with_capacity(raw.len());
    for route in raw {
        let cluster_id = route
            .cluster_id
            .map(|id| cluster_remap.get(&id).cloned().unwrap_or(id));
        if let Some(cluster_id) = &cluster_id {
            if !clusters.contains_key(cluster_id) {
                return Err(GatewayError::UnresolvedCluster(route.id.clone()));
            }
        }
        let specificity = route_specificity(&route.matcher);
        out.push(crate::config::graph::RouteEntry {
            id: route.id,
            hosts: route.matcher.hosts,
            path: route.matcher.path,
            method: route.matcher.method,
            cluster_id,
            metadata: route.metadata,
            specificity,
        });
    }
    Ok(out)
}

/// Specificity formula: exact (non-wildcard) host beats a wildcard host
/// beats no host constraint; an explicit port on the host pattern beats the
/// same host pattern without one; longer, non-wildcard path prefixes beat
/// shorter/wildcard ones. Each component contributes a disjoint bit range so
/// host specificity always dominates path specificity.
fn route_specificity(m: &RawRouteMatch) -> u32 {
    let host_score: u32 = m
        .hosts
        .iter()
        .map(|h| {
            let (host, port) = crate::route::matcher::split_host_port(h);
            let base = if host.contains('*') { 1 } else { 2 };
            base + if port.is_some() { 4 } else { 0 }
        })
        .max()
        .unwrap_or(0);

    let path = &m.path;
    let path_score: u32 = if path.ends_with('*') {
        path.trim_end_matches('*').len() as u32
    } else {
        (path.len() as u32) + 10_000
    };

    (host_score << 20) | path_score.min((1 << 20) - 1)
}

fn index_file_server_items(items: Vec<RawFileServerItem>) -> HashMap<String, RawFileServerItem> {
    let mut out = HashMap::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let key = if item.route_id.is_empty() {
            format!("fileserver_{i}")
        } else {
            item.route_id.clone()
        };
        out.insert(key, item);
    }
    out
}

fn index_simple_res_items(items: Vec<RawSimpleResItem>) -> HashMap<String, RawSimpleResItem> {
    let mut out = HashMap::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let key = if item.route_id.is_empty() {
            format!("simpleres_{i}")
        } else {
            item.route_id.clone()
        };
        out.insert(key, item);
    }
    out
}

// --- DSL tree -> RawConfig -------------------------------------------------

fn get_str(node: &Node, key: &str) -> Option<String> {
    node.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(node: &Node, key: &str) -> bool {
    matches!(node.get(key), Some(v) if v.truthy())
}

fn get_num(node: &Node, key: &str) -> Option<f64> {
    match node.get(key) {
        Some(Value::Number(n)) => Some(*n),
        _ => None,
    }
}

fn get_str_list(node: &Node, key: &str) -> Vec<String> {
    node.get_all(key)
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

fn blocks<'a>(node: &'a Node, key: &str) -> Vec<&'a Node> {
    node.get_all(key)
        .into_iter()
        .filter_map(|v| match v {
            Value::Block(inner) => Some(inner),
            _ => None,
        })
        .collect()
}

fn block_arg(node: &Node, index: usize) -> Option<String> {
    match node.get("_args") {
        Some(Value::List(items)) => items.get(index).and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Converts the generic parse tree produced by [`crate::config::dsl::parse_str`]
/// into the same [`RawConfig`] shape the structured format deserializes into,
/// so both formats share one normalizer.
pub fn node_to_raw_config(root: &Node) -> GatewayResult<RawConfig> {
    let mut raw = RawConfig::default();

    for block in blocks(root, "listen") {
        let host = block_arg(block, 0).unwrap_or_else(|| "0.0.0.0".to_string());
        let port = get_num(block, "port").unwrap_or(0.0) as i64;
        raw.listens.push(RawListener {
            host,
            port,
            tls: get_bool(block, "tls"),
            auto_https_port: get_num(block, "auto_https_port").map(|n| n as u16),
            forward_proxy: get_bool(block, "forward_proxy"),
            stream: get_str(block, "stream"),
        });
    }

    for block in blocks(root, "cert") {
        raw.certificates.push(RawCertEntry {
            host_pattern: block_arg(block, 0).unwrap_or_default(),
            leaf: get_str(block, "leaf").unwrap_or_default(),
            key: get_str(block, "key").unwrap_or_default(),
        });
    }

    for block in blocks(root, "route") {
        let id = block_arg(block, 0).unwrap_or_default();
        let matcher = RawRouteMatch {
            hosts: get_str_list(block, "hosts"),
            path: get_str(block, "path").unwrap_or_else(|| "/*".to_string()),
            method: get_str(block, "method"),
        };
        raw.routes.push(RawRoute {
            id,
            matcher,
            cluster_id: get_str(block, "cluster_id"),
            metadata: HashMap::new(),
        });
    }

    for block in blocks(root, "cluster") {
        let id = block_arg(block, 0).unwrap_or_default();
        let mut destinations = Vec::new();
        for dest_block in blocks(block, "destination") {
            destinations.push(RawDestination {
                id: block_arg(dest_block, 0).unwrap_or_default(),
                address: get_str(dest_block, "address").unwrap_or_default(),
                weight: get_num(dest_block, "weight").unwrap_or(1.0) as u32,
                metadata: HashMap::new(),
            });
        }
        let lb_policy = get_str(block, "lb_policy")
            .and_then(|s| parse_lb_policy(&s))
            .unwrap_or_default();
        let health_check = blocks(block, "health_check").into_iter().next().map(|h| {
            RawHealthCheck {
                method: get_str(h, "method").unwrap_or_else(|| "GET".to_string()),
                path: get_str(h, "path").unwrap_or_else(|| "/".to_string()),
                interval: None,
                timeout: None,
                expect_status: get_str_list(h, "expect_status"),
                predicate_kind: get_str(h, "predicate_kind").and_then(|s| parse_predicate_kind(&s)),
                predicate_value: get_str(h, "predicate_value"),
                fails: get_num(h, "fails").unwrap_or(3.0) as u32,
                passes: get_num(h, "passes").unwrap_or(2.0) as u32,
            }
        });
        raw.clusters.push(RawCluster {
            id,
            destinations,
            lb_policy,
            health_check,
            http_client: RawHttpClient::default(),
            hash_key: get_str(block, "hash_key"),
        });
    }

    for block in blocks(root, "file_server") {
        raw.file_server_items.push(RawFileServerItem {
            route_id: block_arg(block, 0).unwrap_or_default(),
            root: get_str(block, "root").unwrap_or_default(),
            try_files: get_str_list(block, "try_files"),
            defaults: get_str_list(block, "defaults"),
            browse: get_bool(block, "browse"),
            pre_compressed: get_bool(block, "pre_compressed"),
            max_file_size: get_num(block, "max_file_size").map(|n| n as u64),
            throttle_bytes_per_sec: get_num(block, "throttle_bytes_per_sec").map(|n| n as u64),
        });
    }

    for block in blocks(root, "simple_res") {
        raw.simple_res_items.push(RawSimpleResItem {
            route_id: block_arg(block, 0).unwrap_or_default(),
            body: get_str(block, "body").unwrap_or_default(),
            status_code: get_num(block, "status_code").unwrap_or(200.0) as u16,
            content_type: get_str(block, "content_type")
                .unwrap_or_else(|| "text/plain".to_string()),
            headers: HashMap::new(),
            show_req: get_bool(block, "show_req"),
        });
    }

    if let Some(block) = blocks(root, "access_control").into_iter().next() {
        let connection_limit = blocks(block, "connection_limit").into_iter().next().map(|c| {
            RawConnectionLimit {
                per_ip: get_num(c, "per_ip").map(|n| n as u32),
                per_cluster: get_num(c, "per_cluster").map(|n| n as u32),
                total: get_num(c, "total").map(|n| n as u32),
                path_limits: HashMap::new(),
            }
        });
        let geo_control = blocks(block, "geo_control").into_iter().next().map(|g| {
            RawGeoControl {
                enabled: get_bool(g, "enabled"),
                mode: get_str(g, "mode")
                    .map(|m| if m == "deny" { GeoMode::Deny } else { GeoMode::Allow })
                    .unwrap_or(GeoMode::Allow),
                countries: get_str_list(g, "countries"),
                path_rules: HashMap::new(),
            }
        });
        raw.access_control = Some(RawAccessControl {
            whitelist: get_str_list(block, "whitelist"),
            ip_control_enabled: get_bool(block, "ip_control_enabled"),
            blacklist: get_str_list(block, "blacklist"),
            path_rules: HashMap::<String, PathRule>::new(),
            geo_control,
            connection_limit,
        });
    }

    if let Some(block) = blocks(root, "waf").into_iter().next() {
        raw.waf = Some(RawWaf {
            query_patterns: get_str_list(block, "query_patterns"),
            body_patterns: get_str_list(block, "body_patterns"),
            max_request_body_size: get_num(block, "max_request_body_size")
                .unwrap_or(8.0 * 1024.0 * 1024.0) as usize,
        });
    }

    for block in blocks(root, "rate_limiter") {
        let name = block_arg(block, 0).unwrap_or_default();
        let kind_name = get_str(block, "kind").unwrap_or_default();
        let kind = match kind_name.as_str() {
            "fixed_window" => RateLimiterKind::FixedWindow {
                permit_limit: get_num(block, "permit_limit").unwrap_or(100.0) as u32,
                window: std::time::Duration::from_secs(get_num(block, "window_secs").unwrap_or(60.0) as u64),
            },
            "sliding_window" => RateLimiterKind::SlidingWindow {
                permit_limit: get_num(block, "permit_limit").unwrap_or(100.0) as u32,
                window: std::time::Duration::from_secs(get_num(block, "window_secs").unwrap_or(60.0) as u64),
                segments_per_window: get_num(block, "segments_per_window").unwrap_or(6.0) as u32,
            },
            "token_bucket" => RateLimiterKind::TokenBucket {
                replenishment_period: std::time::Duration::from_millis(
                    get_num(block, "replenishment_period_ms").unwrap_or(1000.0) as u64,
                ),
                tokens_per_period: get_num(block, "tokens_per_period").unwrap_or(10.0) as u32,
                permit_limit: get_num(block, "permit_limit").unwrap_or(100.0) as u32,
            },
            _ => RateLimiterKind::Concurrency {
                permit_limit: get_num(block, "permit_limit").unwrap_or(100.0) as u32,
                queue_limit: get_num(block, "queue_limit").unwrap_or(0.0) as u32,
            },
        };
        raw.rate_limiters.push(RawRateLimiter { name, kind });
    }

    for block in blocks(root, "stream") {
        raw.streams.push(RawStreamConfig {
            name: block_arg(block, 0).unwrap_or_default(),
            upstreams: get_str_list(block, "upstreams"),
            policy: get_str(block, "policy")
                .map(|p| parse_stream_policy(&p))
                .unwrap_or_default(),
            connect_timeout: None,
            data_timeout: None,
            health_check_interval: None,
            health_check_timeout: None,
            unhealthy_threshold: get_num(block, "unhealthy_threshold").unwrap_or(2.0) as u32,
            healthy_threshold: get_num(block, "healthy_threshold").unwrap_or(2.0) as u32,
        });
    }

    for block in blocks(root, "forward_proxy") {
        raw.forward_proxies.push(RawForwardProxyConfig {
            port: get_num(block, "port").unwrap_or(0.0) as u16,
            allowed_hosts: get_str_list(block, "allowed_hosts"),
            blocked_hosts: get_str_list(block, "blocked_hosts"),
            require_auth: get_bool(block, "require_auth"),
            credentials: HashMap::new(),
        });
    }

    raw.control_plane_addr = get_str(root, "control_plane_addr");

    Ok(raw)
}

fn parse_lb_policy(s: &str) -> Option<LbPolicy> {
    Some(match s {
        "round_robin" => LbPolicy::RoundRobin,
        "random" => LbPolicy::Random,
        "least_requests" => LbPolicy::LeastRequests,
        "power_of_two_choices" => LbPolicy::PowerOfTwoChoices,
        "first" => LbPolicy::First,
        "weighted_round_robin" => LbPolicy::WeightedRoundRobin,
        "weighted_least_connections" => LbPolicy::WeightedLeastConnections,
        "weighted_random" => LbPolicy::WeightedRandom,
        "ip_hash" => LbPolicy::IpHash,
        "generic_hash" => LbPolicy::GenericHash,
        "consistent_hash" => LbPolicy::ConsistentHash,
        _ => return None,
    })
}

fn parse_predicate_kind(s: &str) -> Option<HealthPredicateKind> {
    Some(match s {
        "contains" => HealthPredicateKind::Contains,
        "match" => HealthPredicateKind::Match,
        "json" => HealthPredicateKind::Json,
        "jsonm" => HealthPredicateKind::Jsonm,
        _ => return None,
    })
}

fn parse_stream_policy(s: &str) -> StreamPolicy {
    match s {
        "random" => StreamPolicy::Random,
        "first" => StreamPolicy::First,
        _ => StreamPolicy::RoundRobin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dsl::parse_str;

    fn sample_raw() -> RawConfig {
        let mut raw = RawConfig::default();
        raw.listens.push(RawListener {
            host: "0.0.0.0".to_string(),
            port: 443,
            tls: true,
            auto_https_port: None,
            forward_proxy: false,
            stream: None,
        });
        raw.listens.push(RawListener {
            host: "0.0.0.0".to_string(),
            port: 443,
            tls: true,
            auto_https_port: None,
            forward_proxy: false,
            stream: None,
        });
        raw.clusters.push(RawCluster {
            id: "backend".to_string(),
            destinations: vec![RawDestination {
                id: "d1".to_string(),
                address: "127.0.0.1:9000".to_string(),
                weight: 1,
                metadata: HashMap::new(),
            }],
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            http_client: RawHttpClient::default(),
            hash_key: None,
        });
        raw.routes.push(RawRoute {
            id: "r1".to_string(),
            matcher: RawRouteMatch {
                hosts: vec!["example.com".to_string()],
                path: "/api/*".to_string(),
                method: None,
            },
            cluster_id: Some("backend".to_string()),
            metadata: HashMap::new(),
        });
        raw.routes.push(RawRoute {
            id: "r2".to_string(),
            matcher: RawRouteMatch {
                hosts: vec![],
                path: "/*".to_string(),
                method: None,
            },
            cluster_id: Some(RESERVED_UNUSED_CLUSTER.to_string()),
            metadata: HashMap::new(),
        });
        raw
    }

    #[test]
    fn duplicate_listener_is_deduplicated() {
        let graph = normalize(sample_raw()).unwrap();
        assert_eq!(graph.listeners.len(), 1);
    }

    #[test]
    fn routes_ordered_by_host_then_path_specificity() {
        let graph = normalize(sample_raw()).unwrap();
        let ordered = graph.ordered_routes();
        assert_eq!(ordered[0].id, "r1");
        assert_eq!(ordered[1].id, "r2");
    }

    #[test]
    fn unresolved_cluster_is_rejected() {
        let mut raw = sample_raw();
        raw.routes.push(RawRoute {
            id: "bad".to_string(),
            matcher: RawRouteMatch {
                hosts: vec![],
                path: "/x".to_string(),
                method: None,
            },
            cluster_id: Some("does-not-exist".to_string()),
            metadata: HashMap::new(),
        });
        assert!(normalize(raw).is_err());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut raw = RawConfig::default();
        raw.listens.push(RawListener {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: false,
            auto_https_port: None,
            forward_proxy: false,
            stream: None,
        });
        assert!(normalize(raw).is_err());
    }

    #[test]
    fn dsl_round_trip_produces_expected_raw_config() {
        let src = r#"
listen 0.0.0.0 {
  port = 8080
}
cluster backend {
  destination d1 {
    address = "127.0.0.1:9000"
    weight = 2
  }
}
route home {
  path = "/*"
  cluster_id = "backend"
}
"#;
        let doc = parse_str(src, "t").unwrap();
        let raw = node_to_raw_config(&doc).unwrap();
        assert_eq!(raw.listens.len(), 1);
        assert_eq!(raw.listens[0].port, 8080);
        assert_eq!(raw.clusters.len(), 1);
        assert_eq!(raw.clusters[0].destinations[0].weight, 2);
        let graph = normalize(raw).unwrap();
        assert_eq!(graph.routes.len(), 1);
        // "backend" plus the always-emitted `cluster_unused` sentinel.
        assert_eq!(graph.clusters.len(), 2);
    }

    #[test]
    fn reserved_unused_cluster_is_always_present() {
        let graph = normalize(RawConfig::default()).unwrap();
        assert!(graph.clusters.contains_key(RESERVED_UNUSED_CLUSTER));
        assert_eq!(graph.clusters[RESERVED_UNUSED_CLUSTER].raw.destinations.len(), 1);
    }

    #[test]
    fn identical_clusters_are_coalesced_by_content() {
        let mut raw = RawConfig::default();
        let dest = RawDestination {
            id: "d1".to_string(),
            address: "127.0.0.1:9000".to_string(),
            weight: 1,
            metadata: HashMap::new(),
        };
        raw.clusters.push(RawCluster {
            id: "a".to_string(),
            destinations: vec![dest.clone()],
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            http_client: RawHttpClient::default(),
            hash_key: None,
        });
        raw.clusters.push(RawCluster {
            id: "b".to_string(),
            destinations: vec![dest],
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            http_client: RawHttpClient::default(),
            hash_key: None,
        });
        raw.routes.push(RawRoute {
            id: "r".to_string(),
            matcher: RawRouteMatch {
                hosts: vec![],
                path: "/*".to_string(),
                method: None,
            },
            cluster_id: Some("b".to_string()),
            metadata: HashMap::new(),
        });

        let graph = normalize(raw).unwrap();
        // "a" survives as canonical, "b" is coalesced away, plus cluster_unused.
        assert_eq!(graph.clusters.len(), 2);
        assert!(graph.clusters.contains_key("a"));
        assert!(!graph.clusters.contains_key("b"));
        // The route that pointed at "b" now resolves through the canonical id.
        assert_eq!(graph.routes[0].cluster_id.as_deref(), Some("a"));
    }
}
