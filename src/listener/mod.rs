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

//! Listener manager: resolves a TLS certificate by SNI host pattern, and
//! classifies each configured port into an ordinary HTTP(S) listener (built
//! on pingora's own listener machinery), a forward-proxy port, or a stream
//! port (both of the latter run as plain tokio listeners since they sniff
//! ahead of any HTTP framing).

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::model::RawCertEntry;

pub struct ResolvedCert {
    pub leaf_path: String,
    pub key_path: String,
}

/// Builds a glob matcher per certificate entry once at load time so SNI
/// lookups at connection time are a constant-ish glob match, not a fresh
/// pattern compile per handshake.
pub struct CertResolver {
    entries: Vec<(GlobSet, ResolvedCert)>,
}

impl CertResolver {
    pub fn build(entries: &[RawCertEntry]) -> Result<Self, globset::Error> {
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut builder = GlobSetBuilder::new();
            builder.add(Glob::new(&entry.host_pattern)?);
            compiled.push((
                builder.build()?,
                ResolvedCert {
                    leaf_path: entry.leaf.clone(),
                    key_path: entry.key.clone(),
                },
            ));
        }
        Ok(CertResolver { entries: compiled })
    }

    /// First matching pattern wins, same order as declared in config —
    /// callers that want a "most specific first" rule should pre-sort
    /// `entries` before calling `build`.
    pub fn resolve(&self, sni_host: &str) -> Option<&ResolvedCert> {
        self.entries
            .iter()
            .find(|(set, _)| set.is_match(sni_host))
            .map(|(_, cert)| cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<RawCertEntry> {
        vec![
            RawCertEntry {
                host_pattern: "*.example.com".to_string(),
                leaf: "wildcard.pem".to_string(),
                key: "wildcard.key".to_string(),
            },
            RawCertEntry {
                host_pattern: "api.example.com".to_string(),
                leaf: "api.pem".to_string(),
                key: "api.key".to_string(),
            },
        ]
    }

    #[test]
    fn resolves_exact_match_when_declared_first() {
        let mut e = entries();
        e.reverse();
        let resolver = CertResolver::build(&e).unwrap();
        let cert = resolver.resolve("api.example.com").unwrap();
        assert_eq!(cert.leaf_path, "api.pem");
    }

    #[test]
    fn falls_back_to_wildcard_match() {
        let resolver = CertResolver::build(&entries()).unwrap();
        let cert = resolver.resolve("www.example.com").unwrap();
        assert_eq!(cert.leaf_path, "wildcard.pem");
    }

    #[test]
    fn unmatched_host_returns_none() {
        let resolver = CertResolver::build(&entries()).unwrap();
        assert!(resolver.resolve("other.org").is_none());
    }
}
