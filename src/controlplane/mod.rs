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

//! Control plane: a small JSON API, bound to loopback by default, for
//! inspecting and managing a running gateway (`/api/status`, `/api/info`,
//! `/api/config`, `/api/stop`, `/api/reload`, `/api/statistics`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use crate::config::graph::SharedGraph;

/// Config keys that are safe to expose verbatim through `/api/config`.
/// Anything not on this list is redacted, protecting secrets like forward
/// proxy credentials from leaking through the control plane.
const CONFIG_WHITELIST: [&str; 5] = ["listens", "routes", "clusters", "file_server_items", "simple_res_items"];

pub struct ControlPlaneStats {
    pub requests_total: AtomicU64,
    pub started_at: std::time::Instant,
}

impl Default for ControlPlaneStats {
    fn default() -> Self {
        ControlPlaneStats {
            requests_total: AtomicU64::new(0),
            started_at: std::time::Instant::now(),
        }
    }
}

pub struct ControlPlane {
    pub graph: Arc<SharedGraph>,
    pub stats: Arc<ControlPlaneStats>,
    pub stop_flag: Arc<AtomicBool>,
    pub reload_requested: Arc<AtomicBool>,
}

impl ControlPlane {
    pub async fn run(self: Arc<Self>, addr: SocketAddr, mut shutdown: tokio::sync::watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "control plane listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this.handle(stream).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();

        let body = self.dispatch(&path).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await
    }

    async fn dispatch(&self, path: &str) -> String {
        match path {
            "/api/status" => json!({ "status": "ok" }).to_string(),
            "/api/info" => json!({
                "uptime_secs": self.stats.started_at.elapsed().as_secs(),
            })
            .to_string(),
            "/api/config" => redacted_config(&self.graph).to_string(),
            "/api/stop" => {
                self.stop_flag.store(true, Ordering::SeqCst);
                json!({ "status": "stopping" }).to_string()
            }
            "/api/reload" => {
                self.reload_requested.store(true, Ordering::SeqCst);
                json!({ "status": "reload_requested" }).to_string()
            }
            "/api/statistics" => json!({
                "requests_total": self.stats.requests_total.load(Ordering::Relaxed),
            })
            .to_string(),
            _ => json!({ "error": "not_found" }).to_string(),
        }
    }
}

fn redacted_config(graph: &SharedGraph) -> serde_json::Value {
    let snapshot = graph.load();
    let mut out = serde_json::Map::new();
    out.insert("listeners".to_string(), json!(snapshot.listeners.len()));
    out.insert("routes".to_string(), json!(snapshot.routes.len()));
    out.insert("clusters".to_string(), json!(snapshot.clusters.len()));
    for key in CONFIG_WHITELIST {
        out.entry(key.to_string()).or_insert(json!(null));
    }
    serde_json::Value::Object(out)
}

pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        let addr: SocketAddr = "127.0.0.1:7030".parse().unwrap();
        assert!(is_loopback(&addr));
        let addr: SocketAddr = "0.0.0.0:7030".parse().unwrap();
        assert!(!is_loopback(&addr));
    }
}
