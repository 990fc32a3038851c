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

mod acme;
mod ccanalyser;
mod cli;
mod cluster;
mod config;
mod controlplane;
mod errors;
mod forwardproxy;
mod geo;
mod listener;
mod pipeline;
mod respond;
mod route;
mod staticfile;
mod streamproxy;
mod util;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use pingora::server::{configuration::Opt, Server, ShutdownWatch};
use pingora::services::background::{background_service, BackgroundService};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use cluster::destination::Destination;
use config::graph::{ListenerKind, SharedGraph};
use config::model::{RawDestination, RawFileServerItem, RawSimpleResItem};
use controlplane::{ControlPlane, ControlPlaneStats};
use forwardproxy::ForwardProxyService;
use pipeline::{build_clusters, AccessState, Gateway, GatewayState};
use streamproxy::StreamProxy;

fn init_logging() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } | Command::Start { config } => run_gateway(config),
        Command::Validate { config } => validate_config(config),
        Command::File { root, port } => run_bare_file_server(root, port),
        Command::Proxy { upstream, port } => run_bare_proxy(upstream, port),
        Command::Respond { body, port } => run_bare_responder(body, port),
        Command::Stop { control_plane } => send_control_command(&control_plane, "/api/stop"),
        Command::Reload { control_plane } => send_control_command(&control_plane, "/api/reload"),
        Command::Environ => print_environ(),
    }
}

fn validate_config(path: PathBuf) {
    match config::load_file(&path) {
        Ok(graph) => {
            info!(
                listeners = graph.listeners.len(),
                routes = graph.routes.len(),
                clusters = graph.clusters.len(),
                "config is valid"
            );
        }
        Err(err) => {
            error!(error = %err, "config is invalid");
            std::process::exit(1);
        }
    }
}

fn print_environ() {
    for (key, value) in std::env::vars() {
        println!("{key}={value}");
    }
}

fn send_control_command(control_plane: &str, path: &str) {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    match TcpStream::connect(control_plane) {
        Ok(mut stream) => {
            let request = format!("GET {path} HTTP/1.1\r\nHost: control-plane\r\nConnection: close\r\n\r\n");
            if stream.write_all(request.as_bytes()).is_ok() {
                let mut response = String::new();
                let _ = stream.read_to_string(&mut response);
                println!("{response}");
            }
        }
        Err(err) => {
            error!(%control_plane, error = %err, "failed to reach control plane");
            std::process::exit(1);
        }
    }
}

/// `edge-gateway file --root ... --port ...`: a one-off static file server
/// for quick local testing, without a config file. Runs through the same
/// pipeline as a real gateway, just with a single synthetic route.
fn run_bare_file_server(root: PathBuf, port: u16) {
    let mut server = Server::new(None).expect("pingora server bootstrap");
    server.bootstrap();

    let mut graph = config::graph::RoutingGraph {
        routes: vec![config::graph::RouteEntry {
            id: "cli_file".to_string(),
            hosts: vec![],
            path: "/*".to_string(),
            method: None,
            cluster_id: None,
            metadata: HashMap::new(),
            specificity: 0,
        }],
        ..Default::default()
    };
    graph.file_server_items.insert(
        "cli_file".to_string(),
        RawFileServerItem {
            route_id: "cli_file".to_string(),
            root: root.to_string_lossy().to_string(),
            try_files: vec![],
            defaults: vec!["index.html".to_string()],
            browse: true,
            pre_compressed: false,
            max_file_size: None,
            throttle_bytes_per_sec: None,
        },
    );

    let state = bare_gateway_state(graph, HashMap::new());
    let gateway = Gateway { state };
    let mut http_service = pingora::proxy::http_proxy_service(&server.configuration, gateway);
    http_service.add_tcp(&format!("0.0.0.0:{port}"));
    server.add_service(http_service);

    info!(%port, root = %root.display(), "standalone file server starting");
    server.run_forever();
}

fn bare_gateway_state(graph: config::graph::RoutingGraph, clusters: HashMap<String, cluster::Cluster>) -> Arc<GatewayState> {
    Arc::new(GatewayState {
        graph: Arc::new(SharedGraph::new(graph)),
        clusters: arc_swap::ArcSwap::new(Arc::new(clusters)),
        access: AccessState {
            whitelist: arc_swap::ArcSwap::new(Arc::new(pipeline::access::CidrSet::parse(&[]))),
            blacklist: arc_swap::ArcSwap::new(Arc::new(pipeline::access::CidrSet::parse(&[]))),
            geo: Box::new(geo::NullGeoLookup),
        },
        waf: arc_swap::ArcSwap::new(Arc::new(None)),
        limiters: dashmap::DashMap::new(),
        connections: Arc::new(pipeline::access::ConnectionTracker::default()),
        cc_analyser: Arc::new(ccanalyser::CcAnalyser::new(ccanalyser::DEFAULT_FB_LIMIT, Duration::from_secs(300))),
        throttles: dashmap::DashMap::new(),
        last_finish: dashmap::DashMap::new(),
    })
}

/// `edge-gateway proxy --upstream ... --port ...`: a one-off single-cluster
/// reverse proxy for quick local testing.
fn run_bare_proxy(upstream: String, port: u16) {
    let mut server = Server::new(None).expect("pingora server bootstrap");
    server.bootstrap();

    let destinations = Arc::new(vec![Destination::from_raw(&RawDestination {
        id: "cli-upstream".to_string(),
        address: upstream.clone(),
        weight: 1,
        metadata: HashMap::new(),
    })]);
    let cluster = cluster::Cluster {
        id: "cli_cluster".to_string(),
        destinations,
        balancer: cluster::lb::LoadBalancer::new(config::model::LbPolicy::First),
        hash_key: None,
    };
    let mut clusters = HashMap::new();
    clusters.insert(cluster.id.clone(), cluster);

    let graph = config::graph::RoutingGraph {
        routes: vec![config::graph::RouteEntry {
            id: "cli_route".to_string(),
            hosts: vec![],
            path: "/*".to_string(),
            method: None,
            cluster_id: Some("cli_cluster".to_string()),
            metadata: HashMap::new(),
            specificity: 0,
        }],
        ..Default::default()
    };

    let state = bare_gateway_state(graph, clusters);
    let gateway = Gateway { state };
    let mut http_service = pingora::proxy::http_proxy_service(&server.configuration, gateway);
    http_service.add_tcp(&format!("0.0.0.0:{port}"));
    server.add_service(http_service);

    info!(%upstream, %port, "standalone reverse proxy starting");
    server.run_forever();
}

/// `edge-gateway respond --body ... --port ...`: a one-off canned-response
/// server for quick local testing. Runs through the same pipeline as a real
/// gateway, just with a single synthetic route.
fn run_bare_responder(body: String, port: u16) {
    let mut server = Server::new(None).expect("pingora server bootstrap");
    server.bootstrap();

    let mut graph = config::graph::RoutingGraph {
        routes: vec![config::graph::RouteEntry {
            id: "cli_respond".to_string(),
            hosts: vec![],
            path: "/*".to_string(),
            method: None,
            cluster_id: None,
            metadata: HashMap::new(),
            specificity: 0,
        }],
        ..Default::default()
    };
    graph.simple_res_items.insert(
        "cli_respond".to_string(),
        RawSimpleResItem {
            route_id: "cli_respond".to_string(),
            body,
            status_code: 200,
            content_type: "text/plain".to_string(),
            headers: HashMap::new(),
            show_req: false,
        },
    );

    let state = bare_gateway_state(graph, HashMap::new());
    let gateway = Gateway { state };
    let mut http_service = pingora::proxy::http_proxy_service(&server.configuration, gateway);
    http_service.add_tcp(&format!("0.0.0.0:{port}"));
    server.add_service(http_service);

    info!(%port, "standalone canned-response server starting");
    server.run_forever();
}

/// Bridges a component's own `run(shutdown)` future (already written against
/// a plain `tokio::sync::watch::Receiver<bool>`, matching pingora's
/// `ShutdownWatch`) into a pingora `BackgroundService`.
struct TaskService<F> {
    name: &'static str,
    task: std::sync::Mutex<Option<F>>,
}

impl<F> TaskService<F> {
    fn new(name: &'static str, task: F) -> Self {
        TaskService {
            name,
            task: std::sync::Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl<F> BackgroundService for TaskService<F>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    async fn start(&self, _shutdown: ShutdownWatch) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            info!(name = self.task_name(), "background task starting");
            task.await;
        }
    }
}

impl<F> TaskService<F> {
    fn task_name(&self) -> &'static str {
        self.name
    }
}

fn run_gateway(config_path: PathBuf) {
    let graph = match config::load_file(&config_path) {
        Ok(g) => g,
        Err(err) => {
            error!(error = %err, "failed to load config");
            std::process::exit(1);
        }
    };

    let clusters = build_clusters(&graph);
    let waf_engine = graph
        .waf
        .as_ref()
        .map(|raw| pipeline::waf::WafEngine::from_raw(raw).expect("valid waf patterns"));
    let limiters = dashmap::DashMap::new();
    for (name, limiter) in &graph.rate_limiters {
        limiters.insert(name.clone(), pipeline::ratelimit::build_limiter(&limiter.kind));
    }
    let whitelist = graph
        .access_control
        .as_ref()
        .map(|ac| pipeline::access::CidrSet::parse(&ac.whitelist))
        .unwrap_or_else(|| pipeline::access::CidrSet::parse(&[]));
    let blacklist = graph
        .access_control
        .as_ref()
        .map(|ac| pipeline::access::CidrSet::parse(&ac.blacklist))
        .unwrap_or_else(|| pipeline::access::CidrSet::parse(&[]));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut server = Server::new(Some(Opt::parse_args())).expect("pingora server bootstrap");
    server.bootstrap();

    // Active health-check loops, one per cluster that declares one.
    for entry in graph.clusters.values() {
        if let Some(check) = entry.raw.health_check.clone() {
            let Some(destinations) = clusters.get(&entry.id).map(|c| c.destinations.clone()) else {
                continue;
            };
            if destinations.is_empty() {
                continue;
            }
            let rx = shutdown_rx.clone();
            let health_service = background_service(
                "cluster-health",
                TaskService::new("cluster-health", cluster::health::run_health_loop(destinations, check, rx)),
            );
            server.add_service(health_service);
        }
    }

    // Forward-proxy ports: HTTP / CONNECT / SOCKS5 sniffed on one socket.
    for (port, fp_config) in graph.forward_proxies.clone() {
        let rx = shutdown_rx.clone();
        let service = ForwardProxyService {
            config: Arc::new(fp_config),
        };
        let wrapped = background_service("forward-proxy", TaskService::new("forward-proxy", async move {
            if let Err(err) = service.run(rx).await {
                error!(%port, %err, "forward proxy exited");
            }
        }));
        server.add_service(wrapped);
    }

    // Raw TCP stream-proxy listeners.
    for listener in &graph.listeners {
        if let ListenerKind::Stream(stream_name) = &listener.kind {
            let Some(stream_config) = graph.streams.get(stream_name).cloned() else {
                continue;
            };
            let proxy = Arc::new(StreamProxy::new(stream_config));
            let port = listener.port;
            let run_rx = shutdown_rx.clone();
            let run_proxy = proxy.clone();
            let run_service = background_service("stream-proxy", TaskService::new("stream-proxy", async move {
                if let Err(err) = run_proxy.run(port, run_rx).await {
                    error!(%port, %err, "stream proxy exited");
                }
            }));
            server.add_service(run_service);

            let health_rx = shutdown_rx.clone();
            let health_proxy = proxy;
            let health_service = background_service("stream-health", TaskService::new("stream-health", async move {
                health_proxy.run_health_loop(health_rx).await;
            }));
            server.add_service(health_service);
        }
    }

    // Control plane, bound to the configured address or loopback by default.
    let control_plane_addr = graph.control_plane_addr.clone().unwrap_or_else(|| "127.0.0.1:7030".to_string());
    let shared_graph = Arc::new(SharedGraph::new(graph));
    let control_plane = Arc::new(ControlPlane {
        graph: shared_graph.clone(),
        stats: Arc::new(ControlPlaneStats::default()),
        stop_flag: Arc::new(AtomicBool::new(false)),
        reload_requested: Arc::new(AtomicBool::new(false)),
    });
    {
        let rx = shutdown_rx.clone();
        let cp = control_plane.clone();
        let addr: std::net::SocketAddr = control_plane_addr.parse().expect("valid control plane address");
        let service = background_service("control-plane", TaskService::new("control-plane", async move {
            if let Err(err) = cp.run(addr, rx).await {
                error!(%err, "control plane exited");
            }
        }));
        server.add_service(service);
    }

    // Behavioural CC analyser: drains per-IP buffers on a 100ms external tick.
    let cc_limits: Vec<ccanalyser::LimitCc> = graph
        .cc_limits
        .iter()
        .map(|l| ccanalyser::LimitCc {
            path: l.path.clone(),
            period: l.period,
            limit_num: l.limit_num,
            fb_time: l.fb_time,
        })
        .collect();
    let cc_analyser = Arc::new(ccanalyser::CcAnalyser::with_limits(ccanalyser::DEFAULT_FB_LIMIT, Duration::from_secs(300), cc_limits));
    {
        let rx = shutdown_rx.clone();
        let analyser = cc_analyser.clone();
        let service = background_service("cc-analyser", TaskService::new("cc-analyser", async move {
            let mut rx = rx;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = ticker.tick() => analyser.tick(),
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
        server.add_service(service);
    }

    let state = Arc::new(GatewayState {
        graph: shared_graph.clone(),
        clusters: arc_swap::ArcSwap::new(Arc::new(clusters)),
        access: AccessState {
            whitelist: arc_swap::ArcSwap::new(Arc::new(whitelist)),
            blacklist: arc_swap::ArcSwap::new(Arc::new(blacklist)),
            geo: Box::new(geo::NullGeoLookup),
        },
        waf: arc_swap::ArcSwap::new(Arc::new(waf_engine)),
        limiters,
        connections: Arc::new(pipeline::access::ConnectionTracker::default()),
        cc_analyser: cc_analyser.clone(),
        throttles: dashmap::DashMap::new(),
        last_finish: dashmap::DashMap::new(),
    });

    let listener_graph = shared_graph.load();
    let cert_resolver = listener::CertResolver::build(&listener_graph.certificates).ok();

    let gateway = Gateway { state };
    let mut http_service = pingora::proxy::http_proxy_service(&server.configuration, gateway);
    for listener in &listener_graph.listeners {
        if !matches!(listener.kind, ListenerKind::Http) {
            continue;
        }
        let addr = format!("{}:{}", listener.host, listener.port);
        if listener.tls {
            match cert_resolver.as_ref().and_then(|r| r.resolve(&listener.host)) {
                Some(resolved) => http_service.add_tls(&addr, &resolved.leaf_path, &resolved.key_path),
                None => error!(%addr, "TLS listener has no matching certificate, skipping"),
            }
        } else {
            http_service.add_tcp(&addr);
        }
    }
    server.add_service(http_service);

    // Held for the process lifetime: dropping the sender would make every
    // `shutdown.changed()` background-service loop spin forever on `Err`.
    let _shutdown_tx = shutdown_tx;
    info!("gateway starting");
    server.run_forever();
}
