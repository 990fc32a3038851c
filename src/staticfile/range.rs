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

//! Parses single-range `Range: bytes=...` headers. Multi-range
//! requests aren't supported; they fall back to a full 200 response, which
//! is the conservative and spec-compliant behaviour.

#[derive(Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    /// Set for an open-ended `bytes=X-` request whose `X` is at or past EOF:
    /// satisfiable per RFC 7233 as a zero-length 206, not a rejection.
    pub zero_length: bool,
}

pub fn parse_range(header: &str, file_len: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || file_len == 0 {
            return None;
        }
        let start = file_len.saturating_sub(suffix_len);
        return Some(ByteRange { start, end: file_len - 1, zero_length: false });
    }

    let start: u64 = start_str.parse().ok()?;
    if end_str.is_empty() {
        if start >= file_len {
            return Some(ByteRange { start, end: start, zero_length: true });
        }
        return Some(ByteRange { start, end: file_len - 1, zero_length: false });
    }

    if start >= file_len {
        return None;
    }
    let end = end_str.parse::<u64>().ok()?.min(file_len.saturating_sub(1));
    if end < start {
        return None;
    }
    Some(ByteRange { start, end, zero_length: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some(ByteRange { start: 0, end: 99, zero_length: false }));
    }

    #[test]
    fn open_ended_range_goes_to_eof() {
        assert_eq!(parse_range("bytes=500-", 1000), Some(ByteRange { start: 500, end: 999, zero_length: false }));
    }

    #[test]
    fn suffix_range_counts_from_end() {
        assert_eq!(parse_range("bytes=-100", 1000), Some(ByteRange { start: 900, end: 999, zero_length: false }));
    }

    #[test]
    fn out_of_bounds_open_ended_is_zero_length() {
        assert_eq!(parse_range("bytes=2000-", 1000), Some(ByteRange { start: 2000, end: 2000, zero_length: true }));
    }

    #[test]
    fn out_of_bounds_explicit_end_is_rejected() {
        assert_eq!(parse_range("bytes=2000-2500", 1000), None);
    }

    #[test]
    fn multi_range_is_unsupported() {
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
    }

    #[test]
    fn end_clamped_to_file_length() {
        assert_eq!(parse_range("bytes=0-99999", 1000), Some(ByteRange { start: 0, end: 999, zero_length: false }));
    }
}
