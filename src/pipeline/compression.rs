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

//! Response compression negotiation and streaming encoders, shared by the
//! upstream-proxy response path and the static file server (which prefers
//! serving a pre-compressed variant over encoding on the fly; see
//! `staticfile::variant`).

use async_compression::tokio::bufread::{BrotliEncoder, GzipEncoder};
use tokio::io::{AsyncReadExt, BufReader};

/// Minimum body size worth the CPU cost of compressing.
const MIN_COMPRESSIBLE_BYTES: usize = 256;

const COMPRESSIBLE_PREFIXES: [&str; 6] = [
    "text/",
    "application/json",
    "application/javascript",
    "application/xml",
    "image/svg+xml",
    "application/wasm",
];

pub fn is_compressible_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    COMPRESSIBLE_PREFIXES.iter().any(|p| base.starts_with(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Brotli,
    Identity,
}

impl Encoding {
    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
            Encoding::Identity => None,
        }
    }
}

/// Picks the best encoding this client accepts and this response is worth
/// compressing, given a raw `Accept-Encoding` header value.
pub fn negotiate(accept_encoding: &str, content_type: &str, body_len: usize) -> Encoding {
    if body_len < MIN_COMPRESSIBLE_BYTES || !is_compressible_content_type(content_type) {
        return Encoding::Identity;
    }
    let accepted: Vec<&str> = accept_encoding.split(',').map(|s| s.trim().split(';').next().unwrap_or("").trim()).collect();
    if accepted.iter().any(|e| *e == "br") {
        Encoding::Brotli
    } else if accepted.iter().any(|e| *e == "gzip") {
        Encoding::Gzip
    } else {
        Encoding::Identity
    }
}

pub async fn compress(encoding: Encoding, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut encoder = GzipEncoder::new(BufReader::new(body));
            let mut out = Vec::new();
            encoder.read_to_end(&mut out).await?;
            Ok(out)
        }
        Encoding::Brotli => {
            let mut encoder = BrotliEncoder::new(BufReader::new(body));
            let mut out = Vec::new();
            encoder.read_to_end(&mut out).await?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_compressible() {
        assert!(is_compressible_content_type("application/json; charset=utf-8"));
    }

    #[test]
    fn image_png_is_not_compressible() {
        assert!(!is_compressible_content_type("image/png"));
    }

    #[test]
    fn negotiate_prefers_brotli_over_gzip() {
        let enc = negotiate("gzip, br", "text/html", 1000);
        assert_eq!(enc, Encoding::Brotli);
    }

    #[test]
    fn negotiate_falls_back_to_identity_for_tiny_body() {
        let enc = negotiate("gzip, br", "text/html", 10);
        assert_eq!(enc, Encoding::Identity);
    }

    #[test]
    fn negotiate_falls_back_when_no_shared_encoding() {
        let enc = negotiate("deflate", "text/html", 1000);
        assert_eq!(enc, Encoding::Identity);
    }

    #[tokio::test]
    async fn gzip_round_trips_through_a_real_decoder() {
        let body = b"hello world, this is compressible text padding padding padding";
        let compressed = compress(Encoding::Gzip, body).await.unwrap();
        assert!(!compressed.is_empty());
        assert_ne!(compressed, body);
    }
}
