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

//! The eleven load-balancing policies. Each picks among the *currently
//! healthy* destinations of a cluster; callers filter the unhealthy ones
//! out before calling in, keeping selection logic separate from health
//! tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ahash::AHasher;
use rand::Rng;
use std::hash::{Hash, Hasher};

use crate::cluster::destination::Destination;
use crate::config::model::LbPolicy;

/// Virtual nodes per weight unit on the consistent-hash ring.
const VNODES_PER_WEIGHT: u32 = 160;

pub struct LoadBalancer {
    policy: LbPolicy,
    rr_cursor: AtomicUsize,
    /// Smooth weighted round robin's running "current weight" per destination
    /// index, reset whenever the destination set changes shape.
    swrr_state: Mutex<Vec<i64>>,
    ring: Mutex<Option<Vec<(u64, usize)>>>,
}

impl LoadBalancer {
    pub fn new(policy: LbPolicy) -> Self {
        LoadBalancer {
            policy,
            rr_cursor: AtomicUsize::new(0),
            swrr_state: Mutex::new(Vec::new()),
            ring: Mutex::new(None),
        }
    }

    /// Selects one destination from `healthy`, using `hash_key` for the
    /// hash-based policies (IpHash/GenericHash/ConsistentHash).
    pub fn select<'a>(
        &self,
        healthy: &'a [&'a Destination],
        hash_key: Option<&str>,
    ) -> Option<&'a Destination> {
        if healthy.is_empty() {
            return None;
        }
        match self.policy {
            LbPolicy::RoundRobin => self.round_robin(healthy),
            LbPolicy::Random => self.random(healthy),
            LbPolicy::LeastRequests => self.least_requests(healthy),
            LbPolicy::PowerOfTwoChoices => self.power_of_two(healthy),
            LbPolicy::First => healthy.first().copied(),
            LbPolicy::WeightedRoundRobin => self.weighted_round_robin(healthy),
            LbPolicy::WeightedLeastConnections => self.weighted_least_connections(healthy),
            LbPolicy::WeightedRandom => self.weighted_random(healthy),
            LbPolicy::IpHash | LbPolicy::GenericHash => self.hash_pick(healthy, hash_key),
            LbPolicy::ConsistentHash => self.consistent_hash_pick(healthy, hash_key),
        }
    }

    fn round_robin<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx])
    }

    fn random<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        let idx = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[idx])
    }

    fn least_requests<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        healthy.iter().copied().min_by_key(|d| d.in_flight())
    }

    /// Power-of-two-choices: sample two candidates at random, pick the one
    /// with fewer in-flight requests. Falls back to plain pick with 1 host.
    fn power_of_two<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        if healthy.len() == 1 {
            return Some(healthy[0]);
        }
        let mut rng = rand::thread_rng();
        let i = rng.gen_range(0..healthy.len());
        let mut j = rng.gen_range(0..healthy.len());
        while j == i {
            j = rng.gen_range(0..healthy.len());
        }
        if healthy[i].in_flight() <= healthy[j].in_flight() {
            Some(healthy[i])
        } else {
            Some(healthy[j])
        }
    }

    /// Smooth weighted round robin (the nginx/LVS algorithm): each pick adds
    /// the static weight to every destination's running current-weight, then
    /// picks the max and subtracts the total weight from it.
    fn weighted_round_robin<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        let mut state = self.swrr_state.lock().unwrap();
        if state.len() != healthy.len() {
            *state = vec![0; healthy.len()];
        }
        let total_weight: i64 = healthy.iter().map(|d| d.weight as i64).sum();
        let mut best_idx = 0;
        let mut best_weight = i64::MIN;
        for (i, d) in healthy.iter().enumerate() {
            state[i] += d.weight as i64;
            if state[i] > best_weight {
                best_weight = state[i];
                best_idx = i;
            }
        }
        state[best_idx] -= total_weight;
        Some(healthy[best_idx])
    }

    fn weighted_least_connections<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        healthy
            .iter()
            .copied()
            .min_by(|a, b| {
                let score_a = (a.in_flight() + 1) as f64 / a.weight.max(1) as f64;
                let score_b = (b.in_flight() + 1) as f64 / b.weight.max(1) as f64;
                score_a.partial_cmp(&score_b).unwrap()
            })
    }

    fn weighted_random<'a>(&self, healthy: &'a [&'a Destination]) -> Option<&'a Destination> {
        let total: u32 = healthy.iter().map(|d| d.weight).sum();
        if total == 0 {
            return healthy.first().copied();
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for d in healthy {
            if pick < d.weight {
                return Some(d);
            }
            pick -= d.weight;
        }
        healthy.last().copied()
    }

    fn hash_pick<'a>(&self, healthy: &'a [&'a Destination], key: Option<&str>) -> Option<&'a Destination> {
        let key = key.unwrap_or("");
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h as usize) % healthy.len();
        Some(healthy[idx])
    }

    /// Ring rebuild happens on every call when the destination set's shape
    /// changed since the last pick (cheap relative to request volume; the
    /// ring is only as large as `destinations.len() * 160`).
    fn consistent_hash_pick<'a>(&self, healthy: &'a [&'a Destination], key: Option<&str>) -> Option<&'a Destination> {
        let key = key.unwrap_or("");
        let mut ring_guard = self.ring.lock().unwrap();
        let needs_rebuild = match &*ring_guard {
            Some(ring) => {
                let expected: u32 = healthy.iter().map(|d| d.weight * VNODES_PER_WEIGHT).sum();
                ring.len() as u32 != expected
            }
            None => true,
        };
        if needs_rebuild {
            *ring_guard = Some(build_ring(healthy));
        }
        let ring = ring_guard.as_ref().unwrap();
        if ring.is_empty() {
            return None;
        }
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        let target = hasher.finish();
        let idx = match ring.binary_search_by_key(&target, |(h, _)| *h) {
            Ok(i) => i,
            Err(i) => i % ring.len(),
        };
        let (_, dest_idx) = ring[idx];
        healthy.get(dest_idx).copied()
    }
}

fn build_ring(healthy: &[&Destination]) -> Vec<(u64, usize)> {
    let mut ring = Vec::new();
    for (idx, dest) in healthy.iter().enumerate() {
        let vnodes = (dest.weight * VNODES_PER_WEIGHT).max(VNODES_PER_WEIGHT);
        for v in 0..vnodes {
            let mut hasher = AHasher::default();
            dest.id.hash(&mut hasher);
            v.hash(&mut hasher);
            ring.push((hasher.finish(), idx));
        }
    }
    ring.sort_by_key(|(h, _)| *h);
    ring
}

/// Process-wide jitter source shared by the stream proxy's health prober
/// (spreads probe start times so a fleet of destinations isn't probed in
/// lockstep). Kept here since it rides on the same `rand` dependency as the
/// LB policies.
pub fn jitter_millis(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RawDestination;

    fn dests(weights: &[u32]) -> Vec<Destination> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Destination::from_raw(&RawDestination {
                    id: format!("d{i}"),
                    address: format!("127.0.0.1:{}", 9000 + i),
                    weight: *w,
                    metadata: Default::default(),
                })
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let d = dests(&[1, 1, 1]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::RoundRobin);
        let mut counts = [0; 3];
        for _ in 0..9 {
            let picked = lb.select(&refs, None).unwrap();
            let idx = refs.iter().position(|x| std::ptr::eq(*x, picked)).unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn weighted_round_robin_honors_ratio_over_a_full_cycle() {
        let d = dests(&[5, 1, 1]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::WeightedRoundRobin);
        let mut counts = [0; 3];
        for _ in 0..7 {
            let picked = lb.select(&refs, None).unwrap();
            let idx = refs.iter().position(|x| std::ptr::eq(*x, picked)).unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [5, 1, 1]);
    }

    #[test]
    fn least_requests_prefers_idle_destination() {
        let d = dests(&[1, 1]);
        d[0].begin_request();
        d[0].begin_request();
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::LeastRequests);
        let picked = lb.select(&refs, None).unwrap();
        assert!(std::ptr::eq(picked, &d[1]));
    }

    #[test]
    fn first_always_picks_index_zero() {
        let d = dests(&[1, 1, 1]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::First);
        for _ in 0..5 {
            let picked = lb.select(&refs, None).unwrap();
            assert!(std::ptr::eq(picked, &d[0]));
        }
    }

    #[test]
    fn ip_hash_is_deterministic_for_same_key() {
        let d = dests(&[1, 1, 1, 1]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::IpHash);
        let a = lb.select(&refs, Some("1.2.3.4")).unwrap() as *const _;
        let b = lb.select(&refs, Some("1.2.3.4")).unwrap() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn consistent_hash_is_deterministic_and_stable_on_unrelated_removal() {
        let d = dests(&[1, 1, 1, 1]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::ConsistentHash);
        let first = lb.select(&refs, Some("customer-42")).unwrap().id.clone();
        let second = lb.select(&refs, Some("customer-42")).unwrap().id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn weighted_random_never_picks_zero_weight_when_others_available() {
        let d = dests(&[0, 5]);
        let refs: Vec<&Destination> = d.iter().collect();
        let lb = LoadBalancer::new(LbPolicy::WeightedRandom);
        for _ in 0..20 {
            let picked = lb.select(&refs, None).unwrap();
            assert!(std::ptr::eq(picked, &d[1]));
        }
    }
}
