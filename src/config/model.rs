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

//! The raw, serde-deserialisable config model. Both the structured
//! `appsettings`-shape format and the normalised form of the DSL parse tree
//! land in these structs before the normaliser (`config::normalize`) turns
//! them into a [`crate::config::graph::RoutingGraph`].

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RawListener {
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub auto_https_port: Option<u16>,
    /// Declares this port as a forward-proxy (HTTP/CONNECT/SOCKS5 sniffed) port
    /// rather than an ordinary L7 listener.
    #[serde(default)]
    pub forward_proxy: bool,
    /// Declares this port as a raw TCP stream-proxy port, referencing a
    /// `StreamConfig` by name.
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCertEntry {
    pub host_pattern: String,
    pub leaf: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRouteMatch {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRoute {
    pub id: String,
    #[serde(rename = "match")]
    pub matcher: RawRouteMatch,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum LbPolicy {
    RoundRobin,
    Random,
    LeastRequests,
    PowerOfTwoChoices,
    First,
    WeightedRoundRobin,
    WeightedLeastConnections,
    WeightedRandom,
    IpHash,
    GenericHash,
    ConsistentHash,
}

impl Default for LbPolicy {
    fn default() -> Self {
        LbPolicy::RoundRobin
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDestination {
    pub id: String,
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub enum HealthPredicateKind {
    Contains,
    Match,
    Json,
    Jsonm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHealthCheck {
    pub method: String,
    pub path: String,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<std::time::Duration>,
    #[serde(default)]
    pub expect_status: Vec<String>,
    #[serde(default)]
    pub predicate_kind: Option<HealthPredicateKind>,
    #[serde(default)]
    pub predicate_value: Option<String>,
    #[serde(default = "default_fails")]
    pub fails: u32,
    #[serde(default = "default_passes")]
    pub passes: u32,
}

fn default_fails() -> u32 {
    3
}
fn default_passes() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHttpClient {
    #[serde(default = "default_max_conn")]
    pub max_conn_per_server: usize,
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub connection_lifetime: Option<std::time::Duration>,
    #[serde(default)]
    pub verify: bool,
}

fn default_max_conn() -> usize {
    1024
}

impl Default for RawHttpClient {
    fn default() -> Self {
        RawHttpClient {
            max_conn_per_server: default_max_conn(),
            request_timeout: None,
            idle_timeout: None,
            connection_lifetime: None,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCluster {
    pub id: String,
    pub destinations: Vec<RawDestination>,
    #[serde(default)]
    pub lb_policy: LbPolicy,
    #[serde(default)]
    pub health_check: Option<RawHealthCheck>,
    #[serde(default)]
    pub http_client: RawHttpClient,
    /// Named expression(s) used to derive the hash key for IpHash/GenericHash/ConsistentHash.
    #[serde(default)]
    pub hash_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFileServerItem {
    pub route_id: String,
    pub root: String,
    #[serde(default)]
    pub try_files: Vec<String>,
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default)]
    pub browse: bool,
    #[serde(default)]
    pub pre_compressed: bool,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub throttle_bytes_per_sec: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSimpleResItem {
    pub route_id: String,
    pub body: String,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub show_req: bool,
}

fn default_status() -> u16 {
    200
}
fn default_content_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAccessControl {
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub ip_control_enabled: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub path_rules: HashMap<String, PathRule>,
    #[serde(default)]
    pub geo_control: Option<RawGeoControl>,
    #[serde(default)]
    pub connection_limit: Option<RawConnectionLimit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathRule {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGeoControl {
    pub enabled: bool,
    pub mode: GeoMode,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub path_rules: HashMap<String, PathRule>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConnectionLimit {
    #[serde(default)]
    pub per_ip: Option<u32>,
    #[serde(default)]
    pub per_cluster: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub path_limits: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWaf {
    #[serde(default)]
    pub query_patterns: Vec<String>,
    #[serde(default)]
    pub body_patterns: Vec<String>,
    #[serde(default = "default_body_cap")]
    pub max_request_body_size: usize,
}

fn default_body_cap() -> usize {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRateLimiter {
    pub name: String,
    pub kind: RateLimiterKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimiterKind {
    FixedWindow {
        permit_limit: u32,
        #[serde(with = "humantime_serde")]
        window: std::time::Duration,
    },
    SlidingWindow {
        permit_limit: u32,
        #[serde(with = "humantime_serde")]
        window: std::time::Duration,
        segments_per_window: u32,
    },
    TokenBucket {
        #[serde(with = "humantime_serde")]
        replenishment_period: std::time::Duration,
        tokens_per_period: u32,
        permit_limit: u32,
    },
    Concurrency {
        permit_limit: u32,
        queue_limit: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStreamConfig {
    pub name: String,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub policy: StreamPolicy,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub data_timeout: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub health_check_interval: Option<std::time::Duration>,
    #[serde(default, with = "humantime_serde")]
    pub health_check_timeout: Option<std::time::Duration>,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
}

fn default_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum StreamPolicy {
    RoundRobin,
    Random,
    First,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy::RoundRobin
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCcLimit {
    pub path: String,
    #[serde(with = "humantime_serde")]
    pub period: std::time::Duration,
    pub limit_num: usize,
    #[serde(with = "humantime_serde")]
    pub fb_time: std::time::Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawForwardProxyConfig {
    pub port: u16,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub listens: Vec<RawListener>,
    #[serde(default)]
    pub certificates: Vec<RawCertEntry>,
    #[serde(default)]
    pub routes: Vec<RawRoute>,
    #[serde(default)]
    pub clusters: Vec<RawCluster>,
    #[serde(default)]
    pub file_server_items: Vec<RawFileServerItem>,
    #[serde(default)]
    pub simple_res_items: Vec<RawSimpleResItem>,
    #[serde(default)]
    pub access_control: Option<RawAccessControl>,
    #[serde(default)]
    pub waf: Option<RawWaf>,
    #[serde(default)]
    pub rate_limiters: Vec<RawRateLimiter>,
    #[serde(default)]
    pub streams: Vec<RawStreamConfig>,
    #[serde(default)]
    pub forward_proxies: Vec<RawForwardProxyConfig>,
    #[serde(default)]
    pub control_plane_addr: Option<String>,
    #[serde(default)]
    pub cc_limits: Vec<RawCcLimit>,
}
