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

//! A cluster destination and its mutable runtime state (in-flight request
//! count, active-health status, passive-failure streak).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use crate::config::model::RawDestination;

/// Consecutive passive (connect/TLS) failures before a destination is
/// marked unhealthy. Not exposed in the config DSL, so kept as a constant
/// rather than threaded through every call site.
const PASSIVE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct Destination {
    pub id: String,
    pub address: String,
    pub weight: u32,
    in_flight: AtomicI64,
    healthy: AtomicBool,
    consecutive_fails: AtomicU32,
    consecutive_passes: AtomicU32,
}

impl Destination {
    pub fn from_raw(raw: &RawDestination) -> Self {
        Destination {
            id: raw.id.clone(),
            address: raw.address.clone(),
            weight: raw.weight.max(1),
            in_flight: AtomicI64::new(0),
            healthy: AtomicBool::new(true),
            consecutive_fails: AtomicU32::new(0),
            consecutive_passes: AtomicU32::new(0),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Advances the health state machine after one active-check probe.
    /// `fails`/`passes` are the configured consecutive-transition thresholds.
    pub fn record_probe(&self, success: bool, fails: u32, passes: u32) {
        if success {
            self.consecutive_fails.store(0, Ordering::Relaxed);
            let passes_now = self.consecutive_passes.fetch_add(1, Ordering::Relaxed) + 1;
            if passes_now >= passes {
                self.healthy.store(true, Ordering::Relaxed);
            }
        } else {
            self.consecutive_passes.store(0, Ordering::Relaxed);
            let fails_now = self.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
            if fails_now >= fails {
                self.healthy.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Passive failure: a proxied request to this destination errored.
    /// Once `PASSIVE_FAILURE_THRESHOLD` consecutive failures accumulate the
    /// destination is marked unhealthy, same as the active-probe fail path.
    pub fn record_passive_failure(&self) {
        self.consecutive_passes.store(0, Ordering::Relaxed);
        let fails_now = self.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails_now >= PASSIVE_FAILURE_THRESHOLD {
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn record_passive_success(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        self.consecutive_fails.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(weight: u32) -> RawDestination {
        RawDestination {
            id: "d1".to_string(),
            address: "127.0.0.1:9000".to_string(),
            weight,
            metadata: Default::default(),
        }
    }

    #[test]
    fn starts_healthy_with_zero_in_flight() {
        let d = Destination::from_raw(&raw(1));
        assert!(d.is_healthy());
        assert_eq!(d.in_flight(), 0);
    }

    #[test]
    fn weight_floor_is_one() {
        let d = Destination::from_raw(&raw(0));
        assert_eq!(d.weight, 1);
    }

    #[test]
    fn becomes_unhealthy_after_threshold_fails() {
        let d = Destination::from_raw(&raw(1));
        d.record_probe(false, 2, 2);
        assert!(d.is_healthy());
        d.record_probe(false, 2, 2);
        assert!(!d.is_healthy());
    }

    #[test]
    fn recovers_after_threshold_passes() {
        let d = Destination::from_raw(&raw(1));
        for _ in 0..PASSIVE_FAILURE_THRESHOLD {
            d.record_passive_failure();
        }
        assert!(!d.is_healthy());
        d.record_probe(true, 2, 2);
        assert!(!d.is_healthy());
        d.record_probe(true, 2, 2);
        assert!(d.is_healthy());
    }

    #[test]
    fn passive_failure_needs_threshold_before_flipping_unhealthy() {
        let d = Destination::from_raw(&raw(1));
        for _ in 0..PASSIVE_FAILURE_THRESHOLD - 1 {
            d.record_passive_failure();
        }
        assert!(d.is_healthy());
        d.record_passive_failure();
        assert!(!d.is_healthy());
    }

    #[test]
    fn in_flight_tracks_begin_end() {
        let d = Destination::from_raw(&raw(1));
        d.begin_request();
        d.begin_request();
        assert_eq!(d.in_flight(), 2);
        d.end_request();
        assert_eq!(d.in_flight(), 1);
    }
}
