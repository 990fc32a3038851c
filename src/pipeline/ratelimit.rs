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

//! The four rate limiter kinds, each keyed per-client (by IP or whatever key
//! the pipeline resolves). The fixed window kind wraps `pingora_limits::Rate`,
//! the same windowed-counter type the upstream gateway's own `appid` limiter
//! is built on; the other three have no ecosystem equivalent and are
//! hand-rolled over a `dashmap`-backed bucket table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pingora_limits::rate::Rate;

use crate::config::model::RateLimiterKind;

pub trait Limiter: Send + Sync {
    /// Returns `true` if the request identified by `key` is admitted.
    fn try_admit(&self, key: &str) -> bool;
}

pub struct FixedWindowLimiter {
    permit_limit: u32,
    rate: Rate,
}

impl FixedWindowLimiter {
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        FixedWindowLimiter {
            permit_limit,
            rate: Rate::new(window),
        }
    }
}

impl Limiter for FixedWindowLimiter {
    fn try_admit(&self, key: &str) -> bool {
        let current = self.rate.observe(&key.to_string(), 1);
        current <= self.permit_limit as isize
    }
}

/// Sliding window approximates true sliding behaviour by weighting the
/// previous fixed window's count by the fraction of it still "in view."
pub struct SlidingWindowLimiter {
    permit_limit: u32,
    window: Duration,
    segment: Duration,
    buckets: DashMap<String, SlidingState>,
}

struct SlidingState {
    segment_start: Instant,
    current: u32,
    previous: u32,
}

impl SlidingWindowLimiter {
    pub fn new(permit_limit: u32, window: Duration, segments_per_window: u32) -> Self {
        let segments = segments_per_window.max(1);
        SlidingWindowLimiter {
            permit_limit,
            window,
            segment: window / segments,
            buckets: DashMap::new(),
        }
    }
}

impl Limiter for SlidingWindowLimiter {
    fn try_admit(&self, key: &str) -> bool {
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| SlidingState {
            segment_start: Instant::now(),
            current: 0,
            previous: 0,
        });
        let elapsed = entry.segment_start.elapsed();
        if elapsed >= self.segment {
            let segments_passed = (elapsed.as_nanos() / self.segment.as_nanos().max(1)) as u32;
            if segments_passed >= 2 {
                entry.previous = 0;
                entry.current = 0;
            } else {
                entry.previous = entry.current;
                entry.current = 0;
            }
            entry.segment_start = Instant::now();
        }
        let weight = 1.0 - (entry.segment_start.elapsed().as_secs_f64() / self.segment.as_secs_f64()).min(1.0);
        let estimate = entry.previous as f64 * weight + entry.current as f64;
        if estimate as u32 >= self.permit_limit {
            return false;
        }
        entry.current += 1;
        true
    }
}

pub struct TokenBucketLimiter {
    capacity: u32,
    tokens_per_period: u32,
    period: Duration,
    buckets: DashMap<String, TokenState>,
}

struct TokenState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketLimiter {
    pub fn new(replenishment_period: Duration, tokens_per_period: u32, permit_limit: u32) -> Self {
        TokenBucketLimiter {
            capacity: permit_limit,
            tokens_per_period,
            period: replenishment_period,
            buckets: DashMap::new(),
        }
    }
}

impl Limiter for TokenBucketLimiter {
    fn try_admit(&self, key: &str) -> bool {
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| TokenState {
            tokens: self.capacity as f64,
            last_refill: Instant::now(),
        });
        let elapsed = entry.last_refill.elapsed();
        let periods = elapsed.as_secs_f64() / self.period.as_secs_f64().max(f64::EPSILON);
        if periods >= 1.0 {
            let refill = periods.floor() * self.tokens_per_period as f64;
            entry.tokens = (entry.tokens + refill).min(self.capacity as f64);
            entry.last_refill = Instant::now();
        }
        if entry.tokens < 1.0 {
            return false;
        }
        entry.tokens -= 1.0;
        true
    }
}

/// Concurrency limiter: bounds in-flight requests per key, optionally
/// queueing up to `queue_limit` beyond the permit limit instead of an
/// outright reject (the pipeline stage treats a queued admit as a delay, not
/// implemented here — only the admission decision is).
pub struct ConcurrencyLimiter {
    permit_limit: u32,
    queue_limit: u32,
    in_flight: DashMap<String, AtomicU32>,
}

impl ConcurrencyLimiter {
    pub fn new(permit_limit: u32, queue_limit: u32) -> Self {
        ConcurrencyLimiter {
            permit_limit,
            queue_limit,
            in_flight: DashMap::new(),
        }
    }

    pub fn release(&self, key: &str) {
        if let Some(counter) = self.in_flight.get(key) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Limiter for ConcurrencyLimiter {
    fn try_admit(&self, key: &str) -> bool {
        let counter = self.in_flight.entry(key.to_string()).or_insert_with(|| AtomicU32::new(0));
        let current = counter.fetch_add(1, Ordering::Relaxed);
        if current < self.permit_limit + self.queue_limit {
            true
        } else {
            counter.fetch_sub(1, Ordering::Relaxed);
            false
        }
    }
}

pub fn build_limiter(kind: &RateLimiterKind) -> Box<dyn Limiter> {
    match kind {
        RateLimiterKind::FixedWindow { permit_limit, window } => {
            Box::new(FixedWindowLimiter::new(*permit_limit, *window))
        }
        RateLimiterKind::SlidingWindow {
            permit_limit,
            window,
            segments_per_window,
        } => Box::new(SlidingWindowLimiter::new(*permit_limit, *window, *segments_per_window)),
        RateLimiterKind::TokenBucket {
            replenishment_period,
            tokens_per_period,
            permit_limit,
        } => Box::new(TokenBucketLimiter::new(*replenishment_period, *tokens_per_period, *permit_limit)),
        RateLimiterKind::Concurrency { permit_limit, queue_limit } => {
            Box::new(ConcurrencyLimiter::new(*permit_limit, *queue_limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_admits_up_to_limit_then_blocks() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_admit("a"));
        assert!(limiter.try_admit("a"));
        assert!(!limiter.try_admit("a"));
    }

    #[test]
    fn fixed_window_keys_are_independent() {
        let limiter = FixedWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_admit("a"));
        assert!(limiter.try_admit("b"));
    }

    #[test]
    fn token_bucket_denies_once_drained() {
        let limiter = TokenBucketLimiter::new(Duration::from_secs(3600), 1, 1);
        assert!(limiter.try_admit("a"));
        assert!(!limiter.try_admit("a"));
    }

    #[test]
    fn concurrency_limiter_allows_queue_beyond_permit() {
        let limiter = ConcurrencyLimiter::new(1, 1);
        assert!(limiter.try_admit("a"));
        assert!(limiter.try_admit("a"));
        assert!(!limiter.try_admit("a"));
    }

    #[test]
    fn concurrency_limiter_releases_slot() {
        let limiter = ConcurrencyLimiter::new(1, 0);
        assert!(limiter.try_admit("a"));
        assert!(!limiter.try_admit("a"));
        limiter.release("a");
        assert!(limiter.try_admit("a"));
    }

    #[test]
    fn sliding_window_admits_within_limit() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(10), 5);
        for _ in 0..5 {
            assert!(limiter.try_admit("a"));
        }
    }
}
