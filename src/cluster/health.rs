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

//! Active health check prober. Runs as a pingora `BackgroundService`,
//! periodically probing every destination in a cluster and feeding the
//! result into
//! [`crate::cluster::destination::Destination::record_probe`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cluster::destination::Destination;
use crate::config::model::{HealthPredicateKind, RawHealthCheck};

/// Evaluates one HTTP probe response against the configured predicate.
pub fn evaluate_predicate(check: &RawHealthCheck, status: u16, body: &str) -> bool {
    if !check.expect_status.is_empty() && !status_matches(&check.expect_status, status) {
        return false;
    }
    match (check.predicate_kind, &check.predicate_value) {
        (Some(HealthPredicateKind::Contains), Some(needle)) => body.contains(needle.as_str()),
        (Some(HealthPredicateKind::Match), Some(pattern)) => regex::Regex::new(pattern)
            .map(|re| re.is_match(body))
            .unwrap_or(false),
        (Some(HealthPredicateKind::Json), Some(expected)) => {
            match (serde_json::from_str(expected), serde_json::from_str(body)) {
                (Ok(expected), Ok(actual)) => json_subset(&expected, &actual),
                _ => false,
            }
        }
        (Some(HealthPredicateKind::Jsonm), Some(expected)) => {
            match (serde_json::from_str::<serde_json::Value>(expected), serde_json::from_str::<serde_json::Value>(body)) {
                (Ok(expected), Ok(actual)) => expected == actual,
                _ => false,
            }
        }
        _ => true,
    }
}

fn status_matches(expect: &[String], status: u16) -> bool {
    expect.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix("xx") {
            status.to_string().starts_with(prefix)
        } else {
            pattern.parse::<u16>().map(|p| p == status).unwrap_or(false)
        }
    })
}

/// True if every key/value in `expected` is present in `actual`, recursively.
/// Objects compare key-by-key (extra keys in `actual` are ignored); arrays
/// require each expected element to match some actual element; anything
/// else falls back to direct equality.
fn json_subset(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .all(|(k, v)| a.get(k).map(|av| json_subset(v, av)).unwrap_or(false)),
        (Value::Array(e), Value::Array(a)) => e.iter().all(|ev| a.iter().any(|av| json_subset(ev, av))),
        _ => expected == actual,
    }
}

/// Performs a single raw-HTTP probe over a fresh TCP connection. Kept
/// deliberately simple (no keep-alive, no pooling) since probes run at a low
/// fixed rate and correctness matters more than throughput here.
pub async fn probe_once(address: &str, check: &RawHealthCheck) -> bool {
    let probe_timeout = check.timeout.unwrap_or(Duration::from_secs(2));
    match timeout(probe_timeout, run_probe(address, check)).await {
        Ok(Ok(passed)) => passed,
        Ok(Err(err)) => {
            debug!(%address, error = %err, "health probe failed");
            false
        }
        Err(_) => {
            debug!(%address, "health probe timed out");
            false
        }
    }
}

async fn run_probe(address: &str, check: &RawHealthCheck) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect(address).await?;
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: health-check\r\nConnection: close\r\n\r\n",
        check.method, check.path
    );
    stream.write_all(request.as_bytes()).await?;
    let mut buf = Vec::with_capacity(4096);
    stream.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);
    let mut parts = text.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or("");
    let body = parts.next().unwrap_or("");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    Ok(evaluate_predicate(check, status, body))
}

/// Loops forever probing every destination of one cluster at the configured
/// interval, until `shutdown` fires.
pub async fn run_health_loop(
    destinations: Arc<Vec<Destination>>,
    check: RawHealthCheck,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let interval = check.interval.unwrap_or(Duration::from_secs(10));
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
        for dest in destinations.iter() {
            let passed = probe_once(&dest.address, &check).await;
            dest.record_probe(passed, check.fails, check.passes);
            if !passed && dest.is_healthy() {
                warn!(address = %dest.address, "destination probe failed but threshold not yet reached");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> RawHealthCheck {
        RawHealthCheck {
            method: "GET".to_string(),
            path: "/healthz".to_string(),
            interval: None,
            timeout: None,
            expect_status: vec!["2xx".to_string()],
            predicate_kind: None,
            predicate_value: None,
            fails: 3,
            passes: 2,
        }
    }

    #[test]
    fn status_class_pattern_matches() {
        assert!(status_matches(&["2xx".to_string()], 204));
        assert!(!status_matches(&["2xx".to_string()], 500));
    }

    #[test]
    fn exact_status_pattern_matches() {
        assert!(status_matches(&["204".to_string()], 204));
    }

    #[test]
    fn contains_predicate() {
        let mut c = check();
        c.predicate_kind = Some(HealthPredicateKind::Contains);
        c.predicate_value = Some("ok".to_string());
        assert!(evaluate_predicate(&c, 200, "status: ok"));
        assert!(!evaluate_predicate(&c, 200, "status: down"));
    }

    #[test]
    fn json_subset_predicate() {
        let mut c = check();
        c.expect_status.clear();
        c.predicate_kind = Some(HealthPredicateKind::Json);
        c.predicate_value = Some(r#"{"healthy": true}"#.to_string());
        assert!(evaluate_predicate(&c, 200, r#"{"healthy": true, "version": "1.2"}"#));
        assert!(!evaluate_predicate(&c, 200, r#"{"healthy": false}"#));
    }

    #[test]
    fn jsonm_equality_predicate() {
        let mut c = check();
        c.expect_status.clear();
        c.predicate_kind = Some(HealthPredicateKind::Jsonm);
        c.predicate_value = Some(r#"{"healthy": true}"#.to_string());
        assert!(evaluate_predicate(&c, 200, r#"{"healthy": true}"#));
        // extra keys break exact equality, unlike the subset predicate above
        assert!(!evaluate_predicate(&c, 200, r#"{"healthy": true, "version": "1.2"}"#));
    }

    #[test]
    fn status_mismatch_short_circuits_before_predicate() {
        let mut c = check();
        c.predicate_kind = Some(HealthPredicateKind::Contains);
        c.predicate_value = Some("ok".to_string());
        assert!(!evaluate_predicate(&c, 500, "ok"));
    }
}
