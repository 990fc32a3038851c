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

//! The L7 request pipeline: access control -> WAF -> rate/throttle ->
//! static serve / canned response / upstream proxy, wired into pingora's
//! `ProxyHttp` trait as one filter-then-proxy chain.

pub mod access;
pub mod compression;
pub mod ratelimit;
pub mod throttle;
pub mod waf;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::{ProxyHttp, Session};
use pingora::upstreams::peer::HttpPeer;
use tracing::{info, warn};

use crate::ccanalyser::{CcAnalyser, Sample};
use crate::cluster::Cluster;
use crate::config::graph::RoutingGraph;
use crate::config::model::RawConfig;
use crate::respond;
use crate::route::matcher::{find_route, split_host_port};
use crate::staticfile;

/// Shared, hot-reloadable state every worker reads from. Clusters and their
/// health/LB state are rebuilt whenever the graph reloads, so no component
/// here is mutated in place across a reload.
pub struct GatewayState {
    pub graph: Arc<crate::config::graph::SharedGraph>,
    pub clusters: arc_swap::ArcSwap<std::collections::HashMap<String, Cluster>>,
    pub access: AccessState,
    pub waf: arc_swap::ArcSwap<Option<waf::WafEngine>>,
    pub limiters: dashmap::DashMap<String, Box<dyn ratelimit::Limiter>>,
    pub connections: Arc<access::ConnectionTracker>,
    pub cc_analyser: Arc<CcAnalyser>,
    /// Byte-rate throttle registries, keyed by the configured rate so routes
    /// sharing a rate share a bucket registry too.
    pub throttles: dashmap::DashMap<u64, Arc<throttle::SharedIpThrottles>>,
    /// Tracks when each IP's last request finished, so the CC analyser can
    /// flag a request that started before its predecessor completed.
    pub last_finish: dashmap::DashMap<IpAddr, Instant>,
}

pub struct AccessState {
    pub whitelist: arc_swap::ArcSwap<access::CidrSet>,
    pub blacklist: arc_swap::ArcSwap<access::CidrSet>,
    pub geo: Box<dyn crate::geo::GeoLookup>,
}

pub fn build_clusters(graph: &RoutingGraph) -> std::collections::HashMap<String, Cluster> {
    graph
        .clusters
        .values()
        .map(|entry| (entry.id.clone(), Cluster::from_raw(&entry.raw)))
        .collect()
}

/// Per-request context threaded through the pingora filter hooks.
#[derive(Default)]
pub struct RouterCtx {
    pub route_id: Option<String>,
    pub cluster_id: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub denied: Option<&'static str>,
    pub served_locally: bool,
    pub request_path: Option<String>,
    pub started_at: Option<Instant>,
    /// Held for the request's lifetime; dropping releases the counted slot.
    pub connection_guard: Option<access::ConnectionGuard>,
    /// Accumulates request body bytes for WAF body inspection, capped at
    /// `WafEngine::max_body_size`.
    pub body_buf: Vec<u8>,
}

pub struct Gateway {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = RouterCtx;

    fn new_ctx(&self) -> Self::CTX {
        RouterCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        ctx.started_at = Some(Instant::now());
        let client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip());
        ctx.client_ip = client_ip;

        if let Some(ip) = client_ip {
            if self.state.cc_analyser.is_banned(ip) {
                return self.deny(session, ctx, "cc_banned", 403).await;
            }
        }

        let graph = self.state.graph.load();
        let host = session
            .req_header()
            .headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.as_str().to_string();
        ctx.request_path = Some(path.clone());

        if let Some(server_addr) = session.server_addr().and_then(|a| a.as_inet()) {
            let port = server_addr.port();
            if let Some(listener) = graph.listeners.iter().find(|l| l.port == port && !l.tls) {
                if let Some(https_port) = listener.auto_https_port {
                    let (host_only, _) = split_host_port(&host);
                    let location = format!("https://{host_only}:{https_port}{path}");
                    return self.redirect(session, ctx, &location).await;
                }
            }
        }

        if let Some(ac) = &graph.access_control {
            if let Some(ip) = client_ip {
                let whitelist = self.state.access.whitelist.load();
                let blacklist = self.state.access.blacklist.load();
                if access::check_ip(ac, &whitelist, &blacklist, ip) == access::Decision::Deny {
                    return self.deny(session, ctx, "ip_denied", 403).await;
                }
                if let Some(geo_control) = &ac.geo_control {
                    if access::check_geo(self.state.access.geo.as_ref(), geo_control, ip) == access::Decision::Deny {
                        return self.deny(session, ctx, "geo_denied", 403).await;
                    }
                }
            }
            if access::check_path(ac, &path) == access::Decision::Deny {
                return self.deny(session, ctx, "path_denied", 403).await;
            }
        }

        if let Some(waf) = self.state.waf.load().as_ref() {
            if let Some(query) = session.req_header().uri.query() {
                if waf.scan_query(query) {
                    return self.deny(session, ctx, "waf_query", 403).await;
                }
            }
        }

        let route = find_route(&graph, &host, &path, &method).map(|r| r.clone());
        let route = match route {
            Some(r) => r,
            None => return self.deny(session, ctx, "no_route", 404).await,
        };
        ctx.route_id = Some(route.id.clone());
        ctx.cluster_id = route.cluster_id.clone();

        if let Some(ac) = &graph.access_control {
            if let Some(limit) = &ac.connection_limit {
                if let Some(ip) = client_ip {
                    let limit_ref = access::RawConnectionLimitRef::from(limit);
                    match self.state.connections.try_acquire(&limit_ref, ip, ctx.cluster_id.as_deref()) {
                        Some(guard) => ctx.connection_guard = Some(guard),
                        None => return self.deny(session, ctx, "connection_limit", 503).await,
                    }
                }
            }
        }

        if let Some(limiter_name) = route.metadata.get("rate_limiter") {
            if let Some(limiter) = self.state.limiters.get(limiter_name) {
                let key = client_ip.map(|ip| ip.to_string()).unwrap_or_default();
                if !limiter.try_admit(&key) {
                    return self.deny(session, ctx, "rate_limited", 429).await;
                }
            }
        }

        if let Some(file_item) = graph.file_server_items.get(&route.id) {
            ctx.served_locally = true;
            let throttle = file_item.throttle_bytes_per_sec.map(|rate| {
                let registry = self
                    .state
                    .throttles
                    .entry(rate)
                    .or_insert_with(|| Arc::new(throttle::SharedIpThrottles::new(rate)))
                    .clone();
                registry.bucket_for(client_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)))
            });
            staticfile::serve(session, file_item, throttle.as_deref()).await?;
            return Ok(true);
        }
        if let Some(res_item) = graph.simple_res_items.get(&route.id) {
            ctx.served_locally = true;
            respond::serve(session, res_item, &host, &path, &method).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<bytes::Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let waf = self.state.waf.load();
        let Some(waf) = waf.as_ref() else {
            return Ok(());
        };
        if !waf.inspects_body() {
            return Ok(());
        }
        if let Some(chunk) = body {
            let remaining = waf.max_body_size().saturating_sub(ctx.body_buf.len());
            let take = chunk.len().min(remaining);
            ctx.body_buf.extend_from_slice(&chunk[..take]);
        }
        if end_of_stream && !ctx.body_buf.is_empty() {
            let text = String::from_utf8_lossy(&ctx.body_buf);
            if waf.scan_body(&text) {
                ctx.denied = Some("waf_body");
                return Err(Error::explain(ErrorType::InternalError, "request body matched a WAF rule"));
            }
        }
        Ok(())
    }

    async fn upstream_peer(&self, _session: &mut Session, ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        let graph = self.state.graph.load();
        let cluster_id = ctx
            .cluster_id
            .as_deref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no cluster resolved for route"))?;
        let clusters = self.state.clusters.load();
        let cluster = clusters
            .get(cluster_id)
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "cluster missing from routing graph"))?;

        let hash_value = ctx.client_ip.map(|ip| ip.to_string());
        let destination = cluster
            .pick(hash_value.as_deref())
            .ok_or_else(|| Error::explain(ErrorType::ConnectionClosed, "no healthy destination"))?;

        destination.begin_request();
        let raw_cluster = &graph.clusters.get(cluster_id).unwrap().raw;
        let tls = raw_cluster.http_client.verify;
        let sni = destination.address.split(':').next().unwrap_or("").to_string();
        Ok(Box::new(HttpPeer::new(&destination.address, tls, sni)))
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session.response_written().map(|r| r.status.as_u16()).unwrap_or(0);
        info!(
            route = ctx.route_id.as_deref().unwrap_or("-"),
            cluster = ctx.cluster_id.as_deref().unwrap_or("-"),
            status,
            denied = ctx.denied.unwrap_or("-"),
            "request completed"
        );

        if let (Some(ip), Some(started_at)) = (ctx.client_ip, ctx.started_at) {
            let finished_at = Instant::now();
            let reentrant = self
                .state
                .last_finish
                .get(&ip)
                .map(|prev| started_at < *prev)
                .unwrap_or(false);
            self.state.last_finish.insert(ip, finished_at);
            self.state.cc_analyser.record(
                ip,
                Sample {
                    path: ctx.request_path.clone().unwrap_or_default(),
                    at: started_at,
                    duration: finished_at.duration_since(started_at),
                    reentrant,
                },
            );
        }
    }
}

impl Gateway {
    async fn deny(&self, session: &mut Session, ctx: &mut RouterCtx, reason: &'static str, status: u16) -> Result<bool> {
        ctx.denied = Some(reason);
        warn!(reason, %status, "request denied");
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("content-length", "0")?;
        session.write_response_header(Box::new(header), true).await?;
        Ok(true)
    }

    async fn redirect(&self, session: &mut Session, ctx: &mut RouterCtx, location: &str) -> Result<bool> {
        ctx.denied = Some("auto_https_redirect");
        let mut header = ResponseHeader::build(301, None)?;
        header.insert_header("location", location)?;
        header.insert_header("content-length", "0")?;
        session.write_response_header(Box::new(header), true).await?;
        Ok(true)
    }
}

pub fn build_limiters(raw: &RawConfig) -> dashmap::DashMap<String, Box<dyn ratelimit::Limiter>> {
    let map = dashmap::DashMap::new();
    for limiter in &raw.rate_limiters {
        map.insert(limiter.name.clone(), ratelimit::build_limiter(&limiter.kind));
    }
    map
}
