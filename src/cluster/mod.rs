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

//! Ties a cluster's destinations, its load-balancing policy and its health
//! state together behind one `select` call.

pub mod destination;
pub mod health;
pub mod lb;

use std::sync::Arc;

use destination::Destination;
use lb::LoadBalancer;

use crate::config::model::RawCluster;

pub struct Cluster {
    pub id: String,
    /// Shared with the active health-check loop for this cluster, so a
    /// probe result and a request's `pick()` always see the same atomic
    /// health state rather than two independently-evolving copies.
    pub destinations: Arc<Vec<Destination>>,
    pub balancer: LoadBalancer,
    pub hash_key: Option<String>,
}

impl Cluster {
    pub fn from_raw(raw: &RawCluster) -> Self {
        Cluster {
            id: raw.id.clone(),
            destinations: Arc::new(raw.destinations.iter().map(Destination::from_raw).collect()),
            balancer: LoadBalancer::new(raw.lb_policy),
            hash_key: raw.hash_key.clone(),
        }
    }

    /// Picks a destination among the currently healthy ones. `hash_value` is
    /// the resolved value of `hash_key` for this request (e.g. client IP for
    /// IpHash, or the value of whatever field GenericHash/ConsistentHash key
    /// on), supplied by the caller since only the pipeline has request
    /// context.
    ///
    /// If no destination is currently healthy, falls back to the full
    /// destination list so the request can still attempt once rather than
    /// failing outright on a cluster that looks entirely down.
    pub fn pick(&self, hash_value: Option<&str>) -> Option<&Destination> {
        let healthy: Vec<&Destination> = self.destinations.iter().filter(|d| d.is_healthy()).collect();
        if healthy.is_empty() {
            let all: Vec<&Destination> = self.destinations.iter().collect();
            return self.balancer.select(&all, hash_value);
        }
        self.balancer.select(&healthy, hash_value)
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{LbPolicy, RawDestination, RawHttpClient};

    fn cluster() -> Cluster {
        Cluster::from_raw(&RawCluster {
            id: "backend".to_string(),
            destinations: vec![
                RawDestination {
                    id: "d1".to_string(),
                    address: "127.0.0.1:9000".to_string(),
                    weight: 1,
                    metadata: Default::default(),
                },
                RawDestination {
                    id: "d2".to_string(),
                    address: "127.0.0.1:9001".to_string(),
                    weight: 1,
                    metadata: Default::default(),
                },
            ],
            lb_policy: LbPolicy::RoundRobin,
            health_check: None,
            http_client: RawHttpClient::default(),
            hash_key: None,
        })
    }

    #[test]
    fn pick_skips_unhealthy_destinations() {
        let c = cluster();
        for _ in 0..3 {
            c.destinations[0].record_passive_failure();
        }
        for _ in 0..5 {
            let picked = c.pick(None).unwrap();
            assert_eq!(picked.id, "d2");
        }
    }

    #[test]
    fn pick_falls_back_to_full_list_when_all_unhealthy() {
        let c = cluster();
        for d in c.destinations.iter() {
            for _ in 0..3 {
                d.record_passive_failure();
            }
        }
        // Every destination is unhealthy, but a request still gets one
        // attempt rather than an outright failure.
        assert!(c.pick(None).is_some());
    }
}
