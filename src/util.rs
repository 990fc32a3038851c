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

//! Shared helpers: placeholder substitution (used by the canned responder
//! and the access-control/WAF rejection bodies) and a couple of small time
//! formatting utilities.

use std::collections::HashMap;

/// Single-pass `{TOKEN}` substitution. Unknown placeholders pass through
/// literally.
pub fn substitute_placeholders(body: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = body[i..].find('}') {
                let key = &body[i + 1..i + end];
                if let Some(value) = values.get(key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// RFC3339-ish timestamp for `{Time}`/`{TIME}`/`{DATE}` placeholders.
pub fn now_http_date() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

/// `base64url(last_write_ticks|size)`, used by the static file server's ETag.
pub fn file_etag(mtime_nanos: u128, size: u64) -> String {
    use base64::Engine;
    let raw = format!("{}|{}", mtime_nanos, size);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}
