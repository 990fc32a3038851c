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

//! Raw TCP stream proxy: picks an upstream per connection (RoundRobin,
//! Random or First), probes it before committing, relays bytes
//! bidirectionally until idle-timeout, and tracks passive+active health the
//! same way the HTTP clusters do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cluster::destination::Destination;
use crate::config::model::{RawDestination, RawStreamConfig, StreamPolicy};

pub struct StreamProxy {
    pub config: RawStreamConfig,
    pub destinations: Vec<Destination>,
    cursor: AtomicUsize,
}

impl StreamProxy {
    pub fn new(config: RawStreamConfig) -> Self {
        let destinations = config
            .upstreams
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                Destination::from_raw(&RawDestination {
                    id: format!("{}-{i}", config.name),
                    address: addr.clone(),
                    weight: 1,
                    metadata: Default::default(),
                })
            })
            .collect();
        StreamProxy {
            config,
            destinations,
            cursor: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> Option<&Destination> {
        let healthy: Vec<&Destination> = self.destinations.iter().filter(|d| d.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        match self.config.policy {
            StreamPolicy::First => healthy.into_iter().next(),
            StreamPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                Some(healthy[idx])
            }
            StreamPolicy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Some(healthy[idx])
            }
        }
    }

    pub async fn run(self: Arc<Self>, listen_port: u16, mut shutdown: tokio::sync::watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!(port = listen_port, stream = %self.config.name, "stream proxy listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, peer) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.serve_one(client).await {
                            warn!(%peer, error = %err, "stream proxy connection ended with error");
                        }
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

    async fn serve_one(&self, mut client: TcpStream) -> std::io::Result<()> {
        let destination = match self.pick() {
            Some(d) => d,
            None => return Ok(()),
        };

        let connect_timeout = self.config.connect_timeout.unwrap_or(Duration::from_secs(5));
        let mut upstream = match timeout(connect_timeout, TcpStream::connect(&destination.address)).await {
            Ok(Ok(stream)) => stream,
            _ => {
                destination.record_passive_failure();
                return Ok(());
            }
        };
        destination.record_passive_success();
        destination.begin_request();

        let data_timeout = self.config.data_timeout.unwrap_or(Duration::from_secs(300));
        let result = timeout(data_timeout, tokio::io::copy_bidirectional(&mut client, &mut upstream)).await;
        destination.end_request();
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                destination.record_passive_failure();
                Err(e)
            }
            Err(_) => Ok(()),
        }
    }

    /// Runs the active health-check loop for this stream's destinations,
    /// probing with a plain TCP connect rather than an HTTP request (a
    /// stream upstream has no HTTP semantics to probe).
    pub async fn run_health_loop(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.config.health_check_interval.unwrap_or(Duration::from_secs(10));
        let probe_timeout = self.config.health_check_timeout.unwrap_or(Duration::from_secs(2));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            for dest in &self.destinations {
                let ok = timeout(probe_timeout, TcpStream::connect(&dest.address)).await.map(|r| r.is_ok()).unwrap_or(false);
                dest.record_probe(ok, self.config.unhealthy_threshold, self.config.healthy_threshold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: StreamPolicy) -> RawStreamConfig {
        RawStreamConfig {
            name: "db".to_string(),
            upstreams: vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()],
            policy,
            connect_timeout: None,
            data_timeout: None,
            health_check_interval: None,
            health_check_timeout: None,
            unhealthy_threshold: 2,
            healthy_threshold: 2,
        }
    }

    #[test]
    fn first_policy_always_picks_first_healthy() {
        let proxy = StreamProxy::new(config(StreamPolicy::First));
        for _ in 0..3 {
            assert_eq!(proxy.pick().unwrap().address, "127.0.0.1:1");
        }
    }

    #[test]
    fn round_robin_alternates() {
        let proxy = StreamProxy::new(config(StreamPolicy::RoundRobin));
        let a = proxy.pick().unwrap().address.clone();
        let b = proxy.pick().unwrap().address.clone();
        assert_ne!(a, b);
    }

    #[test]
    fn skips_unhealthy_destination() {
        let proxy = StreamProxy::new(config(StreamPolicy::First));
        for _ in 0..3 {
            proxy.destinations[0].record_passive_failure();
        }
        assert_eq!(proxy.pick().unwrap().address, "127.0.0.1:2");
    }
}
