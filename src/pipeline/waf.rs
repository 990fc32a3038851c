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

//! WAF stage: opaque regexes matched against the query string and the
//! request body. Rules themselves are just strings handed to us by config —
//! the rule *language* is out of scope here, only the matching engine is
//! ours to build.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::RegexSet;

use crate::config::model::RawWaf;

pub struct WafEngine {
    query_set: RegexSet,
    body_set: RegexSet,
    max_body: usize,
    /// Caches a match verdict for `(rule_set_hash, content_hash)` for 60s so
    /// identical repeated payloads (retried requests, polling clients) don't
    /// re-run every regex each time.
    cache: DashMap<u64, (Instant, bool)>,
}

const CACHE_TTL: Duration = Duration::from_secs(60);

impl WafEngine {
    pub fn from_raw(raw: &RawWaf) -> Result<Self, regex::Error> {
        Ok(WafEngine {
            query_set: RegexSet::new(&raw.query_patterns)?,
            body_set: RegexSet::new(&raw.body_patterns)?,
            max_body: raw.max_request_body_size,
            cache: DashMap::new(),
        })
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body
    }

    /// Whether any body pattern is configured at all; lets callers skip
    /// accumulating request body bytes entirely when there's nothing to scan.
    pub fn inspects_body(&self) -> bool {
        !self.body_set.is_empty()
    }

    pub fn scan_query(&self, query: &str) -> bool {
        if self.query_set.is_empty() {
            return false;
        }
        self.scan_with_cache(query, true)
    }

    pub fn scan_body(&self, body: &str) -> bool {
        if self.body_set.is_empty() {
            return false;
        }
        self.scan_with_cache(body, false)
    }

    fn scan_with_cache(&self, content: &str, is_query: bool) -> bool {
        let key = cache_key(content, is_query);
        if let Some(entry) = self.cache.get(&key) {
            if entry.0.elapsed() < CACHE_TTL {
                return entry.1;
            }
        }
        let normalized = normalize_sql_escapes(content);
        let matched = if is_query {
            self.query_set.is_match(&normalized)
        } else {
            self.body_set.is_match(&normalized)
        };
        self.cache.insert(key, (Instant::now(), matched));
        matched
    }
}

fn cache_key(content: &str, is_query: bool) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    is_query.hash(&mut hasher);
    content.hash(&mut hasher);
    hasher.finish()
}

/// Undoes common SQL-injection obfuscation: URL-decodes the value, unwinds
/// doubled/backslash-escaped quotes, collapses `/* */` comments, then
/// lower-cases the result so rules written against one case still fire
/// regardless of keyword casing in the payload.
fn normalize_sql_escapes(input: &str) -> String {
    let decoded = percent_decode(input);
    let unescaped = decoded
        .replace("''", "'")
        .replace("\\'", "'")
        .replace("\\\"", "\"")
        .replace("/**/", " ");
    unescaped.to_lowercase()
}

/// Decodes `%XX` percent-escapes and `+` as space. Malformed escapes are
/// passed through verbatim rather than rejected.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                Ok(byte) => {
                    out.push(byte);
                    i += 3;
                }
                Err(_) => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waf(query: &[&str], body: &[&str]) -> WafEngine {
        WafEngine::from_raw(&RawWaf {
            query_patterns: query.iter().map(|s| s.to_string()).collect(),
            body_patterns: body.iter().map(|s| s.to_string()).collect(),
            max_request_body_size: 1024,
        })
        .unwrap()
    }

    #[test]
    fn matches_sql_injection_in_query() {
        let w = waf(&["(?i)union\\s+select"], &[]);
        assert!(w.scan_query("id=1 UNION SELECT password FROM users"));
        assert!(!w.scan_query("id=1"));
    }

    #[test]
    fn matches_body_pattern() {
        let w = waf(&[], &["<script>"]);
        assert!(w.scan_body("<script>alert(1)</script>"));
        assert!(!w.scan_body("hello world"));
    }

    #[test]
    fn empty_rule_set_never_matches() {
        let w = waf(&[], &[]);
        assert!(!w.scan_query("anything"));
        assert!(!w.scan_body("anything"));
    }

    #[test]
    fn normalizes_doubled_quote_escape() {
        let w = waf(&["(?i)or\\s+1=1"], &[]);
        assert!(w.scan_query("x=1'' OR 1=1 --"));
    }

    #[test]
    fn url_decodes_before_matching() {
        let w = waf(&["union select"], &[]);
        assert!(w.scan_query("id=1%20UNION%20SELECT%20password"));
    }

    #[test]
    fn lowercases_keywords_before_matching() {
        let w = waf(&["drop table"], &[]);
        assert!(w.scan_query("x=DROP TABLE users"));
    }

    #[test]
    fn cached_result_is_reused() {
        let w = waf(&["(?i)drop\\s+table"], &[]);
        assert!(w.scan_query("DROP TABLE users"));
        assert!(w.scan_query("DROP TABLE users"));
        assert_eq!(w.cache.len(), 1);
    }
}
