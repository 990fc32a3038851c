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

//! Byte-rate response body throttling: a per-URL fixed bytes/sec cap, and a
//! per-IP shared token bucket so one client can't starve others sharing the
//! same throttled route.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;

/// One throttle bucket: `rate_bytes_per_sec` tokens refill continuously,
/// `available` tracks the running balance (can go negative transiently while
/// a chunk is being drained, mirroring a real token bucket's burst debt).
pub struct ByteRateThrottle {
    rate_bytes_per_sec: f64,
    available: Mutex<BucketState>,
}

use std::sync::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl ByteRateThrottle {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        ByteRateThrottle {
            rate_bytes_per_sec: rate_bytes_per_sec.max(1) as f64,
            available: Mutex::new(BucketState {
                tokens: rate_bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until `len` bytes' worth of budget is available, then debits
    /// it. Called once per outgoing chunk by the response body wrapper.
    pub async fn throttle(&self, len: usize) {
        loop {
            let wait = {
                let mut state = self.available.lock().unwrap();
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_bytes_per_sec)
                    .min(self.rate_bytes_per_sec * 2.0);
                state.last_refill = Instant::now();

                if state.tokens >= len as f64 {
                    state.tokens -= len as f64;
                    None
                } else {
                    let deficit = len as f64 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_bytes_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

/// Registry of per-IP shared buckets for routes configured with a
/// client-shared (rather than per-URL-fixed) throttle.
pub struct SharedIpThrottles {
    rate_bytes_per_sec: u64,
    buckets: DashMap<std::net::IpAddr, std::sync::Arc<ByteRateThrottle>>,
}

impl SharedIpThrottles {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        SharedIpThrottles {
            rate_bytes_per_sec,
            buckets: DashMap::new(),
        }
    }

    pub fn bucket_for(&self, ip: std::net::IpAddr) -> std::sync::Arc<ByteRateThrottle> {
        self.buckets
            .entry(ip)
            .or_insert_with(|| std::sync::Arc::new(ByteRateThrottle::new(self.rate_bytes_per_sec)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn small_chunk_within_budget_does_not_wait() {
        let throttle = ByteRateThrottle::new(1_000_000);
        let start = StdInstant::now();
        throttle.throttle(100).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn oversized_chunk_waits_proportionally() {
        let throttle = ByteRateThrottle::new(1000);
        let start = StdInstant::now();
        throttle.throttle(1000).await; // drains initial burst allowance
        throttle.throttle(500).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn shared_ip_throttles_reuse_the_same_bucket() {
        let registry = SharedIpThrottles::new(1000);
        let ip: std::net::IpAddr = "1.2.3.4".parse().unwrap();
        let a = registry.bucket_for(ip);
        let b = registry.bucket_for(ip);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
