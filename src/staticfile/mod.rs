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

//! Static file server: safe path resolution, `try_files`, directory
//! defaults, browse listing, pre-compressed variant negotiation and
//! byte-range support.

pub mod range;
pub mod variant;

use std::path::{Component, Path, PathBuf};

use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::Session;
use tokio::io::AsyncReadExt;

use crate::config::model::RawFileServerItem;
use crate::pipeline::{compression, throttle::ByteRateThrottle};
use crate::util::{file_etag, now_http_date};

/// Output is written in bounded chunks so a configured byte-rate throttle has
/// somewhere to apply backpressure; unthrottled responses still pay one
/// extra `write_response_body` call per chunk, which is cheap next to the
/// disk read it follows.
const WRITE_CHUNK_BYTES: usize = 64 * 1024;

async fn write_chunked(session: &mut Session, body: &[u8], throttle: Option<&ByteRateThrottle>) -> Result<()> {
    if body.is_empty() {
        session.write_response_body(Vec::new().into(), true).await?;
        return Ok(());
    }
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + WRITE_CHUNK_BYTES).min(body.len());
        let chunk = &body[offset..end];
        if let Some(t) = throttle {
            t.throttle(chunk.len()).await;
        }
        offset = end;
        let is_last = offset >= body.len();
        session.write_response_body(chunk.to_vec().into(), is_last).await?;
    }
    Ok(())
}

/// Resolves `root` + request path, rejecting any `..` component traversal
/// attempt outright rather than trying to normalize it away.
pub fn safe_resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(root.join(candidate))
}

/// Walks `try_files` in order, returning the first candidate that exists on
/// disk (relative to `root`), or `None` if none do.
pub fn resolve_try_files(root: &Path, request_path: &str, try_files: &[String]) -> Option<PathBuf> {
    for pattern in try_files {
        let substituted = pattern.replace("$path", request_path);
        if let Some(candidate) = safe_resolve(root, &substituted) {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("txt") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

pub fn render_directory_listing(dir: &Path, request_path: &str) -> String {
    let mut entries: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    let mut body = format!("<html><body><h1>Index of {request_path}</h1><ul>");
    for name in entries {
        body.push_str(&format!("<li><a href=\"{name}\">{name}</a></li>"));
    }
    body.push_str("</ul></body></html>");
    body
}

pub async fn serve(session: &mut Session, item: &RawFileServerItem, throttle: Option<&ByteRateThrottle>) -> Result<()> {
    let root = PathBuf::from(&item.root);
    let request_path = session.req_header().uri.path().to_string();

    let resolved = match safe_resolve(&root, &request_path) {
        Some(p) => p,
        None => return respond_status(session, 400).await,
    };

    let mut target = resolved.clone();
    if target.is_dir() {
        let mut found = None;
        for default_name in &item.defaults {
            let candidate = target.join(default_name);
            if candidate.is_file() {
                found = Some(candidate);
                break;
            }
        }
        match found {
            Some(f) => target = f,
            None if item.browse => {
                let body = render_directory_listing(&target, &request_path);
                return respond_body(session, 200, "text/html; charset=utf-8", body.into_bytes()).await;
            }
            None => return respond_status(session, 404).await,
        }
    }

    if !target.is_file() {
        if let Some(candidate) = resolve_try_files(&root, &request_path, &item.try_files) {
            target = candidate;
        } else {
            return respond_status(session, 404).await;
        }
    }

    let metadata = match std::fs::metadata(&target) {
        Ok(m) => m,
        Err(_) => return respond_status(session, 404).await,
    };
    if let Some(cap) = item.max_file_size {
        if metadata.len() > cap {
            return respond_status(session, 413).await;
        }
    }

    let accept_encoding = session
        .req_header()
        .headers
        .get("accept-encoding")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let (actual_path, content_encoding) = if item.pre_compressed {
        variant::pick_precompressed(&target, &accept_encoding)
    } else {
        (target.clone(), None)
    };

    let actual_metadata = std::fs::metadata(&actual_path).unwrap_or(metadata);
    let mtime_nanos = actual_metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let etag = file_etag(mtime_nanos, actual_metadata.len());

    let if_none_match = session
        .req_header()
        .headers
        .get("if-none-match")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    if if_none_match.as_deref() == Some(etag.as_str()) {
        let mut header = ResponseHeader::build(304, None)?;
        header.insert_header("etag", &etag)?;
        session.write_response_header(Box::new(header), true).await?;
        return Ok(());
    }

    let range_header = session
        .req_header()
        .headers
        .get("range")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let mut file = tokio::fs::File::open(&actual_path).await.map_err(|e| {
        Error::explain(ErrorType::ReadError, format!("static file open failed: {e}"))
    })?;
    let file_len = actual_metadata.len();

    let content_type = mime_for(&target);

    if let Some(range_spec) = range_header.as_deref().and_then(|r| range::parse_range(r, file_len)) {
        let len = if range_spec.zero_length {
            0
        } else {
            (range_spec.end - range_spec.start + 1) as usize
        };
        let mut buf = vec![0u8; len];
        if len > 0 {
            use tokio::io::{AsyncSeekExt, SeekFrom};
            file.seek(SeekFrom::Start(range_spec.start)).await.ok();
            file.read_exact(&mut buf).await.map_err(|e| Error::explain(ErrorType::ReadError, e.to_string()))?;
        }

        let mut header = ResponseHeader::build(206, None)?;
        header.insert_header("content-type", content_type)?;
        header.insert_header("content-length", len.to_string())?;
        header.insert_header(
            "content-range",
            format!("bytes {}-{}/{}", range_spec.start, range_spec.end, file_len),
        )?;
        header.insert_header("etag", &etag)?;
        header.insert_header("last-modified", now_http_date())?;
        if let Some(enc) = content_encoding {
            header.insert_header("content-encoding", enc)?;
        }
        session.write_response_header(Box::new(header), false).await?;
        write_chunked(session, &buf, throttle).await?;
        return Ok(());
    }

    let mut buf = Vec::with_capacity(file_len as usize);
    file.read_to_end(&mut buf).await.map_err(|e| Error::explain(ErrorType::ReadError, e.to_string()))?;

    // Only negotiate on-the-fly compression when no pre-compressed variant
    // was already selected on disk, to avoid double-compressing.
    let (buf, content_encoding) = if content_encoding.is_none() {
        let encoding = compression::negotiate(&accept_encoding, content_type, buf.len());
        let compressed = compression::compress(encoding, &buf).await.unwrap_or(buf);
        (compressed, encoding.as_header_value())
    } else {
        (buf, content_encoding)
    };

    let mut header = ResponseHeader::build(200, None)?;
    header.insert_header("content-type", content_type)?;
    header.insert_header("content-length", buf.len().to_string())?;
    header.insert_header("etag", &etag)?;
    header.insert_header("last-modified", now_http_date())?;
    header.insert_header("accept-ranges", "bytes")?;
    if let Some(enc) = content_encoding {
        header.insert_header("content-encoding", enc)?;
    }
    session.write_response_header(Box::new(header), false).await?;
    write_chunked(session, &buf, throttle).await?;
    Ok(())
}

async fn respond_status(session: &mut Session, status: u16) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("content-length", "0")?;
    session.write_response_header(Box::new(header), true).await?;
    Ok(())
}

async fn respond_body(session: &mut Session, status: u16, content_type: &str, body: Vec<u8>) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("content-type", content_type)?;
    header.insert_header("content-length", body.len().to_string())?;
    session.write_response_header(Box::new(header), false).await?;
    session.write_response_body(body.into(), true).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        let root = Path::new("/srv/www");
        assert!(safe_resolve(root, "/../../etc/passwd").is_none());
    }

    #[test]
    fn resolves_plain_path() {
        let root = Path::new("/srv/www");
        let resolved = safe_resolve(root, "/index.html").unwrap();
        assert_eq!(resolved, Path::new("/srv/www/index.html"));
    }

    #[test]
    fn mime_type_by_extension() {
        assert_eq!(mime_for(Path::new("a.js")), "application/javascript; charset=utf-8");
        assert_eq!(mime_for(Path::new("a.unknown")), "application/octet-stream");
    }
}
