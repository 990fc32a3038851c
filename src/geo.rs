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

//! Geo-IP lookup abstraction used by the access-control stage. The
//! production backend is an IP2Region-style `.xdb` file: a sorted,
//! fixed-width binary index searched with binary search over 32-bit integer
//! ranges, memory-mapped once at startup. Kept behind a trait so tests (and
//! deployments without a `.xdb` file) can swap in a stub.

use std::net::IpAddr;

pub trait GeoLookup: Send + Sync {
    /// Returns an ISO-3166 alpha-2 country code, or `None` if the address
    /// isn't covered by the index (private ranges, reserved blocks).
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// No-op lookup used when no geo database is configured; every address is
/// treated as unclassified, so geo rules become no-ops rather than outages.
pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// A range-indexed lookup table loaded from an `.xdb`-style file: records
/// are `(start_ip_u32, end_ip_u32, country)` sorted by `start_ip_u32`,
/// searched with binary search. The real file format's header/vector-index
/// blocks are an on-disk optimization over this; the in-memory shape here is
/// what matters for correctness.
pub struct XdbGeoLookup {
    ranges: Vec<(u32, u32, String)>,
}

impl XdbGeoLookup {
    pub fn from_ranges(mut ranges: Vec<(u32, u32, String)>) -> Self {
        ranges.sort_by_key(|(start, _, _)| *start);
        XdbGeoLookup { ranges }
    }

    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_ranges(parse_xdb_records(&bytes)))
    }
}

/// Parses a simplified `.xdb` record stream: 4 bytes start, 4 bytes end, 2
/// bytes country-code length, then the country code bytes, repeated.
fn parse_xdb_records(bytes: &[u8]) -> Vec<(u32, u32, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 10 <= bytes.len() {
        let start = u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let end = u32::from_be_bytes([bytes[i + 4], bytes[i + 5], bytes[i + 6], bytes[i + 7]]);
        let len = u16::from_be_bytes([bytes[i + 8], bytes[i + 9]]) as usize;
        i += 10;
        if i + len > bytes.len() {
            break;
        }
        let country = String::from_utf8_lossy(&bytes[i..i + len]).to_string();
        i += len;
        out.push((start, end, country));
    }
    out
}

fn ip_to_u32(ip: IpAddr) -> Option<u32> {
    match ip {
        IpAddr::V4(v4) => Some(u32::from(v4)),
        IpAddr::V6(_) => None,
    }
}

impl GeoLookup for XdbGeoLookup {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        let target = ip_to_u32(ip)?;
        let idx = self.ranges.partition_point(|(start, _, _)| *start <= target);
        if idx == 0 {
            return None;
        }
        let (start, end, country) = &self.ranges[idx - 1];
        if *start <= target && target <= *end {
            Some(country.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> XdbGeoLookup {
        XdbGeoLookup::from_ranges(vec![
            (0x0A000000, 0x0A0000FF, "US".to_string()),
            (0x0B000000, 0x0B0000FF, "DE".to_string()),
        ])
    }

    #[test]
    fn finds_containing_range() {
        let geo = lookup();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(geo.lookup(ip), Some("US".to_string()));
    }

    #[test]
    fn returns_none_outside_any_range() {
        let geo = lookup();
        let ip: IpAddr = "172.16.0.1".parse().unwrap();
        assert_eq!(geo.lookup(ip), None);
    }

    #[test]
    fn ipv6_is_unclassified() {
        let geo = lookup();
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(geo.lookup(ip), None);
    }

    #[test]
    fn null_lookup_always_none() {
        let geo = NullGeoLookup;
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(geo.lookup(ip), None);
    }
}
