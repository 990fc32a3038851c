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

//! Access-control stage: CIDR whitelist/blacklist, path-level allow/deny,
//! geo allow/deny and the connection-limit counters. Runs first in the
//! pipeline so a denied request never reaches the WAF or rate limiter.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ipnetwork::IpNetwork;

use crate::config::model::{GeoMode, PathRule, RawAccessControl};
use crate::geo::GeoLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Parses the CIDR list once per reload rather than per-request.
pub struct CidrSet {
    networks: Vec<IpNetwork>,
}

impl CidrSet {
    pub fn parse(entries: &[String]) -> Self {
        let networks = entries
            .iter()
            .filter_map(|e| {
                e.parse::<IpNetwork>()
                    .or_else(|_| e.parse::<IpAddr>().map(IpNetwork::from))
                    .ok()
            })
            .collect();
        CidrSet { networks }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|n| n.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn path_rule_decision(rule: &PathRule, path: &str) -> Option<Decision> {
    if rule.deny.iter().any(|p| glob_prefix_match(p, path)) {
        return Some(Decision::Deny);
    }
    if rule.allow.iter().any(|p| glob_prefix_match(p, path)) {
        return Some(Decision::Allow);
    }
    None
}

fn glob_prefix_match(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Evaluates the IP allow/deny rules. Whitelist, if non-empty, is
/// exclusive: anything not on it is denied. Blacklist always denies.
pub fn check_ip(
    config: &RawAccessControl,
    whitelist: &CidrSet,
    blacklist: &CidrSet,
    ip: IpAddr,
) -> Decision {
    if config.ip_control_enabled {
        if blacklist.contains(ip) {
            return Decision::Deny;
        }
        if !whitelist.is_empty() && !whitelist.contains(ip) {
            return Decision::Deny;
        }
    }
    Decision::Allow
}

/// Longest literal prefix wins across every rule's allow/deny patterns, not
/// just the first rule a `HashMap` happens to iterate.
pub fn check_path(config: &RawAccessControl, path: &str) -> Decision {
    let mut best: Option<(usize, Decision)> = None;
    for rule in config.path_rules.values() {
        for pattern in &rule.deny {
            if let Some(specificity) = glob_prefix_specificity(pattern, path) {
                best = Some(more_specific(best, (specificity, Decision::Deny)));
            }
        }
        for pattern in &rule.allow {
            if let Some(specificity) = glob_prefix_specificity(pattern, path) {
                best = Some(more_specific(best, (specificity, Decision::Allow)));
            }
        }
    }
    best.map(|(_, decision)| decision).unwrap_or(Decision::Allow)
}

/// A deny beats an allow of equal specificity.
fn more_specific(current: Option<(usize, Decision)>, candidate: (usize, Decision)) -> (usize, Decision) {
    match current {
        Some(c) if c.0 > candidate.0 => c,
        Some(c) if c.0 == candidate.0 && c.1 == Decision::Deny => c,
        _ => candidate,
    }
}

fn glob_prefix_specificity(pattern: &str, path: &str) -> Option<usize> {
    if glob_prefix_match(pattern, path) {
        Some(pattern.trim_end_matches('*').len())
    } else {
        None
    }
}

pub fn check_geo(geo: &dyn GeoLookup, control: &crate::config::model::RawGeoControl, ip: IpAddr) -> Decision {
    if !control.enabled {
        return Decision::Allow;
    }
    let country = match geo.lookup(ip) {
        Some(c) => c,
        None => return Decision::Allow,
    };
    let listed = control.countries.iter().any(|c| c.eq_ignore_ascii_case(&country));
    match control.mode {
        GeoMode::Allow => {
            if listed {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }
        GeoMode::Deny => {
            if listed {
                Decision::Deny
            } else {
                Decision::Allow
            }
        }
    }
}

/// Tracks live connection counts for the total/per-IP/per-cluster limits.
/// Counters are released by the caller via `ConnectionGuard`'s `Drop`.
#[derive(Default)]
pub struct ConnectionTracker {
    total: AtomicU32,
    per_ip: DashMap<IpAddr, u32>,
    per_cluster: DashMap<String, u32>,
}

pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    ip: IpAddr,
    cluster: Option<String>,
}

impl ConnectionTracker {
    /// Attempts to admit one more connection; returns `None` if any
    /// configured limit would be exceeded. Takes `self` as an `Arc` since the
    /// returned guard must outlive the borrowed `&self` of any one pipeline
    /// hook — it's released when the request's context is dropped.
    pub fn try_acquire(
        self: &Arc<Self>,
        limit: &RawConnectionLimitRef,
        ip: IpAddr,
        cluster: Option<&str>,
    ) -> Option<ConnectionGuard> {
        if let Some(total_limit) = limit.total {
            if self.total.load(Ordering::Relaxed) >= total_limit {
                return None;
            }
        }
        if let Some(per_ip_limit) = limit.per_ip {
            let current = self.per_ip.get(&ip).map(|v| *v).unwrap_or(0);
            if current >= per_ip_limit {
                return None;
            }
        }
        if let (Some(per_cluster_limit), Some(cluster_id)) = (limit.per_cluster, cluster) {
            let current = self.per_cluster.get(cluster_id).map(|v| *v).unwrap_or(0);
            if current >= per_cluster_limit {
                return None;
            }
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        *self.per_ip.entry(ip).or_insert(0) += 1;
        if let Some(cluster_id) = cluster {
            *self.per_cluster.entry(cluster_id.to_string()).or_insert(0) += 1;
        }

        Some(ConnectionGuard {
            tracker: self.clone(),
            ip,
            cluster: cluster.map(str::to_string),
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.total.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut count) = self.tracker.per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
        }
        if let Some(cluster) = &self.cluster {
            if let Some(mut count) = self.tracker.per_cluster.get_mut(cluster) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

pub struct RawConnectionLimitRef {
    pub total: Option<u32>,
    pub per_ip: Option<u32>,
    pub per_cluster: Option<u32>,
}

impl From<&crate::config::model::RawConnectionLimit> for RawConnectionLimitRef {
    fn from(raw: &crate::config::model::RawConnectionLimit) -> Self {
        RawConnectionLimitRef {
            total: raw.total,
            per_ip: raw.per_ip,
            per_cluster: raw.per_cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ac() -> RawAccessControl {
        RawAccessControl {
            whitelist: vec![],
            ip_control_enabled: true,
            blacklist: vec![],
            path_rules: HashMap::new(),
            geo_control: None,
            connection_limit: None,
        }
    }

    #[test]
    fn blacklisted_ip_is_denied() {
        let ac = ac();
        let black = CidrSet::parse(&["10.0.0.0/8".to_string()]);
        let white = CidrSet::parse(&[]);
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(check_ip(&ac, &white, &black, ip), Decision::Deny);
    }

    #[test]
    fn non_whitelisted_ip_denied_when_whitelist_present() {
        let ac = ac();
        let white = CidrSet::parse(&["192.168.0.0/16".to_string()]);
        let black = CidrSet::parse(&[]);
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(check_ip(&ac, &white, &black, ip), Decision::Deny);
    }

    #[test]
    fn whitelisted_ip_allowed() {
        let ac = ac();
        let white = CidrSet::parse(&["192.168.0.0/16".to_string()]);
        let black = CidrSet::parse(&[]);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(check_ip(&ac, &white, &black, ip), Decision::Allow);
    }

    #[test]
    fn path_deny_rule_wins_over_allow() {
        let rule = PathRule {
            allow: vec!["/admin/*".to_string()],
            deny: vec!["/admin/secrets".to_string()],
        };
        let mut ac = ac();
        ac.path_rules.insert("admin".to_string(), rule);
        assert_eq!(check_path(&ac, "/admin/secrets"), Decision::Deny);
        assert_eq!(check_path(&ac, "/admin/dashboard"), Decision::Allow);
    }

    #[test]
    fn most_specific_rule_wins_across_separate_path_rules() {
        let mut ac = ac();
        // Declared in an order that would pick the wrong rule under plain
        // `HashMap` iteration if specificity weren't compared explicitly.
        ac.path_rules.insert(
            "z-broad".to_string(),
            PathRule { allow: vec!["/*".to_string()], deny: vec![] },
        );
        ac.path_rules.insert(
            "a-narrow".to_string(),
            PathRule { allow: vec![], deny: vec!["/api/admin/*".to_string()] },
        );
        assert_eq!(check_path(&ac, "/api/admin/delete"), Decision::Deny);
        assert_eq!(check_path(&ac, "/api/public"), Decision::Allow);
    }

    #[test]
    fn connection_tracker_enforces_total_limit() {
        let tracker = Arc::new(ConnectionTracker::default());
        let limit = RawConnectionLimitRef {
            total: Some(1),
            per_ip: None,
            per_cluster: None,
        };
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        let _g1 = tracker.try_acquire(&limit, ip, None).unwrap();
        assert!(tracker.try_acquire(&limit, ip, None).is_none());
    }

    #[test]
    fn connection_guard_releases_on_drop() {
        let tracker = Arc::new(ConnectionTracker::default());
        let limit = RawConnectionLimitRef {
            total: Some(1),
            per_ip: None,
            per_cluster: None,
        };
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        {
            let _g1 = tracker.try_acquire(&limit, ip, None).unwrap();
        }
        assert!(tracker.try_acquire(&limit, ip, None).is_some());
    }
}
