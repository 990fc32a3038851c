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

//! Behavioural challenge-collapsar (CC) traffic analyser. Every inbound
//! request is sampled into a per-IP ring buffer; a 100ms tick loop drains
//! buffers that have crossed `fb_limit` samples and runs four heuristics in
//! order, banning the IP the moment one fires.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Default per-IP sample threshold before a buffer is evaluated.
pub const DEFAULT_FB_LIMIT: usize = 50;
/// Requests costing more than 3x the buffer's average duration are treated
/// as outliers and excluded from the reentrancy ratio.
const OUTLIER_COST_MULTIPLIER: f64 = 3.0;
/// Reentrancy ratio above which traffic is banned.
const REENTRANCY_BAN_RATIO: f64 = 0.9;
/// Mean access interval above which traffic is classified as normal human
/// browsing and the remaining heuristics are skipped.
const NORMAL_MEAN_INTERVAL: Duration = Duration::from_millis(500);
/// Dominant-path heuristic parameters.
const MAX_FREQ_GET_NUMS: usize = 3;
const MAX_FREQ_MIN_REQS: usize = 100;
const MAX_FREQ_FB_RATIO: f64 = 0.9;

/// One configured per-path limit: `ip x path` exceeding `limit_num` within
/// `period` bans the client for `fb_time`.
#[derive(Debug, Clone)]
pub struct LimitCc {
    pub path: String,
    pub period: Duration,
    pub limit_num: usize,
    pub fb_time: Duration,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub path: String,
    pub at: Instant,
    pub duration: Duration,
    /// Whether the request was still in flight when the *next* sample for
    /// this IP arrived (a proxy for "didn't wait for the response").
    pub reentrant: bool,
}

#[derive(Default)]
pub struct IpBuffer {
    samples: Vec<Sample>,
}

pub struct CcAnalyser {
    buffers: DashMap<IpAddr, IpBuffer>,
    banned: DashMap<IpAddr, (Instant, Duration)>,
    fb_limit: usize,
    ban_duration: Duration,
    limits: Vec<LimitCc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Ban,
}

impl CcAnalyser {
    pub fn new(fb_limit: usize, ban_duration: Duration) -> Self {
        Self::with_limits(fb_limit, ban_duration, Vec::new())
    }

    pub fn with_limits(fb_limit: usize, ban_duration: Duration, limits: Vec<LimitCc>) -> Self {
        CcAnalyser {
            buffers: DashMap::new(),
            banned: DashMap::new(),
            fb_limit,
            ban_duration,
            limits,
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        match self.banned.get(&ip) {
            Some(entry) => entry.0.elapsed() < entry.1,
            None => false,
        }
    }

    pub fn record(&self, ip: IpAddr, sample: Sample) {
        let mut buffer = self.buffers.entry(ip).or_default();
        buffer.samples.push(sample);
    }

    /// Runs once per 100ms tick: evaluates and drains every buffer that has
    /// reached `fb_limit`, banning IPs whose traffic trips a heuristic.
    pub fn tick(&self) {
        let ready: Vec<IpAddr> = self
            .buffers
            .iter()
            .filter(|e| e.samples.len() >= self.fb_limit)
            .map(|e| *e.key())
            .collect();

        for ip in ready {
            if let Some((_, buffer)) = self.buffers.remove(&ip) {
                if let (Verdict::Ban, fb_time) = evaluate(&buffer.samples, &self.limits) {
                    warn!(%ip, "CC analyser banned client");
                    self.banned.insert(ip, (Instant::now(), fb_time.unwrap_or(self.ban_duration)));
                }
            }
        }
    }
}

/// Runs the four heuristics in order, short-circuiting as soon as one
/// decides. Mirrors the "classify then escalate" structure real CC
/// mitigations use: cheap counters first, statistical checks last. Returns
/// the ban duration override when heuristic 1 (the only one with its own
/// configured `fbTime`) is what fired.
pub fn evaluate(samples: &[Sample], limits: &[LimitCc]) -> (Verdict, Option<Duration>) {
    if samples.is_empty() {
        return (Verdict::Clean, None);
    }

    if let Some(fb_time) = per_path_cc_counter(samples, limits) {
        return (Verdict::Ban, Some(fb_time));
    }

    if let Some(ratio) = reentrancy_ratio(samples) {
        if ratio > REENTRANCY_BAN_RATIO {
            return (Verdict::Ban, None);
        }
    }

    if mean_access_interval(samples) > NORMAL_MEAN_INTERVAL {
        return (Verdict::Clean, None);
    }

    if dominant_path_share(samples) {
        return (Verdict::Ban, None);
    }

    (Verdict::Clean, None)
}

/// For each configured `LimitCc{path, period, limitNum, fbTime}`, bans for
/// `fbTime` once this IP's requests to `path` within the last `period`
/// exceed `limitNum`.
fn per_path_cc_counter(samples: &[Sample], limits: &[LimitCc]) -> Option<Duration> {
    let now = Instant::now();
    for limit in limits {
        let count = samples
            .iter()
            .filter(|s| s.path == limit.path && now.saturating_duration_since(s.at) <= limit.period)
            .count();
        if count > limit.limit_num {
            return Some(limit.fb_time);
        }
    }
    None
}

/// Sorts by time, drops outliers costing more than 3x the average duration,
/// then returns the fraction of remaining samples marked reentrant.
fn reentrancy_ratio(samples: &[Sample]) -> Option<f64> {
    let mut sorted: Vec<&Sample> = samples.iter().collect();
    sorted.sort_by_key(|s| s.at);

    let total_cost: f64 = sorted.iter().map(|s| s.duration.as_secs_f64()).sum();
    let avg_cost = total_cost / sorted.len() as f64;
    if avg_cost <= 0.0 {
        return None;
    }

    let filtered: Vec<&&Sample> = sorted
        .iter()
        .filter(|s| s.duration.as_secs_f64() <= avg_cost * OUTLIER_COST_MULTIPLIER)
        .collect();
    if filtered.is_empty() {
        return None;
    }
    let reentrant_count = filtered.iter().filter(|s| s.reentrant).count();
    Some(reentrant_count as f64 / filtered.len() as f64)
}

fn mean_access_interval(samples: &[Sample]) -> Duration {
    let mut sorted: Vec<&Sample> = samples.iter().collect();
    sorted.sort_by_key(|s| s.at);
    if sorted.len() < 2 {
        return Duration::MAX;
    }
    let span = sorted.last().unwrap().at.duration_since(sorted[0].at);
    span / (sorted.len() as u32 - 1)
}

/// The top `MAX_FREQ_GET_NUMS` paths by request count, when they together
/// account for more than `MAX_FREQ_FB_RATIO` of a buffer large enough to be
/// meaningful, indicate automated traffic pounding a small surface.
fn dominant_path_share(samples: &[Sample]) -> bool {
    if samples.len() < MAX_FREQ_MIN_REQS {
        return false;
    }
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for s in samples {
        *counts.entry(s.path.as_str()).or_insert(0) += 1;
    }
    let mut counted: Vec<usize> = counts.into_values().collect();
    counted.sort_unstable_by(|a, b| b.cmp(a));
    let top_sum: usize = counted.iter().take(MAX_FREQ_GET_NUMS).sum();
    top_sum as f64 / samples.len() as f64 > MAX_FREQ_FB_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(path: &str, offset_ms: u64, duration_ms: u64, reentrant: bool) -> Sample {
        Sample {
            path: path.to_string(),
            at: Instant::now() + Duration::from_millis(offset_ms),
            duration: Duration::from_millis(duration_ms),
            reentrant,
        }
    }

    #[test]
    fn empty_buffer_is_clean() {
        assert_eq!(evaluate(&[], &[]).0, Verdict::Clean);
    }

    #[test]
    fn single_path_hammering_is_banned() {
        let samples: Vec<Sample> = (0..120).map(|i| sample("/login", i, 10, false)).collect();
        assert_eq!(evaluate(&samples, &[]).0, Verdict::Ban);
    }

    #[test]
    fn slow_varied_browsing_is_clean() {
        let samples: Vec<Sample> = (0..10)
            .map(|i| sample(&format!("/page{i}"), i * 1000, 10, false))
            .collect();
        assert_eq!(evaluate(&samples, &[]).0, Verdict::Clean);
    }

    #[test]
    fn high_reentrancy_is_banned() {
        let samples: Vec<Sample> = (0..20).map(|i| sample(&format!("/p{}", i % 5), i * 5, 10, true)).collect();
        assert_eq!(evaluate(&samples, &[]).0, Verdict::Ban);
    }

    #[test]
    fn dominant_few_paths_over_threshold_is_banned() {
        let mut samples: Vec<Sample> = (0..95).map(|i| sample("/a", i, 10, false)).collect();
        samples.extend((0..10).map(|i| sample("/b", 95 + i, 10, false)));
        assert_eq!(evaluate(&samples, &[]).0, Verdict::Ban);
    }

    #[test]
    fn per_path_limit_bans_before_other_heuristics_run() {
        let limits = vec![LimitCc {
            path: "/login".to_string(),
            period: Duration::from_secs(60),
            limit_num: 10,
            fb_time: Duration::from_secs(120),
        }];
        // Slow, varied-duration traffic that would otherwise read as clean —
        // only the per-path counter should trip.
        let samples: Vec<Sample> = (0..11).map(|i| sample("/login", i * 2000, 10, false)).collect();
        let (verdict, fb_time) = evaluate(&samples, &limits);
        assert_eq!(verdict, Verdict::Ban);
        assert_eq!(fb_time, Some(Duration::from_secs(120)));
    }

    #[test]
    fn analyser_bans_and_remembers_until_duration_elapses() {
        let analyser = CcAnalyser::new(5, Duration::from_secs(60));
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        for i in 0..5 {
            analyser.record(ip, sample("/x", i, 10, false));
        }
        analyser.tick();
        assert!(analyser.is_banned(ip));
    }
}
