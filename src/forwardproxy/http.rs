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

//! Plain-HTTP forward-proxy mode: the client sends an absolute-URI request
//! line (`GET http://host/path HTTP/1.1`); we rewrite it to an origin-form
//! request against the resolved host and relay the response back verbatim.

use httparse::{Request, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{decode_basic_auth, is_authorized, is_host_allowed};
use crate::config::model::RawForwardProxyConfig;

const MAX_HEADERS_COUNT: usize = 64;
const MAX_REQUEST_SIZE: usize = 64 * 1024;

pub async fn handle(mut client: TcpStream, config: &RawForwardProxyConfig) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut request = Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(Status::Complete(size)) => break size,
            Ok(Status::Partial) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    return Ok(());
                }
                continue;
            }
            Err(_) => {
                send_error(&mut client, 400, "Bad Request").await?;
                return Ok(());
            }
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut request = Request::new(&mut headers);
    request.parse(&buf).ok();
    let method = request.method.unwrap_or("GET").to_string();
    let uri = request.path.unwrap_or("").to_string();

    let parsed = match url::Url::parse(&uri) {
        Ok(u) => u,
        Err(_) => {
            send_error(&mut client, 400, "Bad Request").await?;
            return Ok(());
        }
    };
    let host = parsed.host_str().unwrap_or("").to_string();
    if !is_host_allowed(config, &host) {
        send_error(&mut client, 403, "Forbidden").await?;
        return Ok(());
    }

    let mut proxy_auth = None;
    let mut forwarded_headers = String::new();
    for header in request.headers.iter() {
        if header.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("proxy-authorization") {
            proxy_auth = Some(value.trim().to_string());
            continue;
        }
        forwarded_headers.push_str(header.name);
        forwarded_headers.push_str(": ");
        forwarded_headers.push_str(value.trim());
        forwarded_headers.push_str("\r\n");
    }

    if !is_authorized(config, proxy_auth.as_deref()) {
        send_error(&mut client, 407, "Proxy Authentication Required").await?;
        return Ok(());
    }
    let _ = proxy_auth.as_deref().and_then(decode_basic_auth);

    let port = parsed.port().unwrap_or(80);
    let mut upstream = TcpStream::connect((host.as_str(), port)).await?;

    let origin_form = if let Some(query) = parsed.query() {
        format!("{}?{}", parsed.path(), query)
    } else {
        parsed.path().to_string()
    };
    let request_line = format!(
        "{method} {origin_form} HTTP/1.1\r\nHost: {host}\r\n{forwarded_headers}Connection: close\r\n\r\n"
    );
    upstream.write_all(request_line.as_bytes()).await?;
    if buf.len() > header_end {
        upstream.write_all(&buf[header_end..]).await?;
    }

    tokio::io::copy(&mut upstream, &mut client).await?;
    Ok(())
}

async fn send_error(client: &mut TcpStream, status: u16, reason: &str) -> std::io::Result<()> {
    let body = format!("{status} {reason}");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    client.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use httparse::{Request, Status};

    #[test]
    fn parses_complete_request() {
        let buf = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut request = Request::new(&mut headers);
        match request.parse(buf) {
            Ok(Status::Complete(size)) => assert_eq!(size, buf.len()),
            other => panic!("expected complete parse, got {other:?}"),
        }
        assert_eq!(request.path, Some("http://example.com/"));
    }

    #[test]
    fn reports_partial_on_truncated_headers() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut request = Request::new(&mut headers);
        assert!(matches!(request.parse(buf), Ok(Status::Partial)));
    }
}
