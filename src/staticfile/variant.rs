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

//! Pre-compressed variant negotiation: if `index.html.br`/`.gz`/`.zst`
//! exists next to `index.html` and the client accepts that encoding, serve
//! it directly instead of compressing on the fly.

use std::path::{Path, PathBuf};

const CANDIDATES: [(&str, &str); 3] = [("br", "br"), ("gzip", "gz"), ("zstd", "zst")];

pub fn pick_precompressed(original: &Path, accept_encoding: &str) -> (PathBuf, Option<&'static str>) {
    let accepted: Vec<&str> = accept_encoding.split(',').map(|s| s.trim().split(';').next().unwrap_or("").trim()).collect();
    for (token, header_value) in CANDIDATES {
        if !accepted.iter().any(|e| *e == token) {
            continue;
        }
        let mut candidate = original.as_os_str().to_os_string();
        candidate.push(".");
        candidate.push(extension_for(token));
        let candidate_path = PathBuf::from(candidate);
        if candidate_path.is_file() {
            return (candidate_path, Some(static_header(token).unwrap_or(header_value)));
        }
    }
    (original.to_path_buf(), None)
}

fn extension_for(token: &str) -> &'static str {
    match token {
        "br" => "br",
        "gzip" => "gz",
        "zstd" => "zst",
        _ => "",
    }
}

fn static_header(token: &str) -> Option<&'static str> {
    match token {
        "br" => Some("br"),
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn falls_back_to_original_when_no_variant_exists() {
        let dir = std::env::temp_dir();
        let original = dir.join("gateway-variant-test-missing.html");
        std::fs::File::create(&original).unwrap();
        let (path, enc) = pick_precompressed(&original, "br, gzip");
        assert_eq!(path, original);
        assert_eq!(enc, None);
        let _ = std::fs::remove_file(&original);
    }

    #[test]
    fn picks_brotli_variant_when_present_and_accepted() {
        let dir = std::env::temp_dir();
        let original = dir.join("gateway-variant-test.html");
        let br = dir.join("gateway-variant-test.html.br");
        std::fs::File::create(&original).unwrap();
        std::fs::File::create(&br).unwrap().write_all(b"x").unwrap();
        let (path, enc) = pick_precompressed(&original, "gzip, br");
        assert_eq!(path, br);
        assert_eq!(enc, Some("br"));
        let _ = std::fs::remove_file(&original);
        let _ = std::fs::remove_file(&br);
    }
}
