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

//! The normalised routing graph and its hot-reload wrapper. A fresh
//! [`RoutingGraph`] is built by `config::normalize::normalize` on every load
//! or reload and swapped in atomically via `arc_swap::ArcSwap`, following the
//! `arc_swap`-backed global-config pattern, generalized to the full model.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::model::{
    RawAccessControl, RawCcLimit, RawCertEntry, RawFileServerItem, RawForwardProxyConfig,
    RawRateLimiter, RawSimpleResItem, RawStreamConfig, RawWaf,
};

/// A listener bound to `(host, port)` with an optional TLS cert resolved at
/// bind time and a dispatch kind describing what the listener multiplexes.
#[derive(Debug, Clone)]
pub struct Listener {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub auto_https_port: Option<u16>,
    pub kind: ListenerKind,
}

#[derive(Debug, Clone)]
pub enum ListenerKind {
    Http,
    ForwardProxy,
    Stream(String),
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub id: String,
    pub hosts: Vec<String>,
    pub path: String,
    pub method: Option<String>,
    pub cluster_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Higher values are tried first; computed from path/host specificity.
    pub specificity: u32,
}

#[derive(Debug, Clone)]
pub struct ClusterEntry {
    pub id: String,
    pub raw: crate::config::model::RawCluster,
}

/// The fully normalised, query-ready configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct RoutingGraph {
    pub listeners: Vec<Listener>,
    pub certificates: Vec<RawCertEntry>,
    pub routes: Vec<RouteEntry>,
    pub clusters: HashMap<String, ClusterEntry>,
    pub file_server_items: HashMap<String, RawFileServerItem>,
    pub simple_res_items: HashMap<String, RawSimpleResItem>,
    pub access_control: Option<RawAccessControl>,
    pub waf: Option<RawWaf>,
    pub rate_limiters: HashMap<String, RawRateLimiter>,
    pub streams: HashMap<String, RawStreamConfig>,
    pub forward_proxies: HashMap<u16, RawForwardProxyConfig>,
    pub control_plane_addr: Option<String>,
    pub cc_limits: Vec<RawCcLimit>,
}

impl RoutingGraph {
    /// Routes ordered by descending specificity, ties broken by `id`
    /// lexicographically.
    pub fn ordered_routes(&self) -> Vec<&RouteEntry> {
        let mut routes: Vec<&RouteEntry> = self.routes.iter().collect();
        routes.sort_by(|a, b| b.specificity.cmp(&a.specificity).then_with(|| a.id.cmp(&b.id)));
        routes
    }
}

/// Hot-reloadable holder for the active [`RoutingGraph`]. Cloned cheaply via
/// `Arc`; `reload` swaps the whole graph in one atomic store so in-flight
/// requests keep the snapshot they started with.
pub struct SharedGraph {
    inner: ArcSwap<RoutingGraph>,
}

impl SharedGraph {
    pub fn new(graph: RoutingGraph) -> Self {
        SharedGraph {
            inner: ArcSwap::new(Arc::new(graph)),
        }
    }

    pub fn load(&self) -> Arc<RoutingGraph> {
        self.inner.load_full()
    }

    pub fn reload(&self, graph: RoutingGraph) {
        self.inner.store(Arc::new(graph));
    }
}
