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

//! Canned responder: a fixed status/body/headers response with placeholder
//! substitution, and an optional `show_req` mode that dumps the inbound
//! request instead of the configured body.

use std::collections::HashMap;

use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::Session;

use crate::config::model::RawSimpleResItem;
use crate::pipeline::compression;
use crate::util::{now_http_date, substitute_placeholders};

pub fn render_body(item: &RawSimpleResItem, host: &str, path: &str, method: &str, query: &str, scheme: &str, client_ip: &str, user_agent: &str) -> String {
    let now = now_http_date();
    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("PORT", String::new());
    values.insert("HOST", host.to_string());
    values.insert("PATH", path.to_string());
    values.insert("METHOD", method.to_string());
    values.insert("QUERY", query.to_string());
    values.insert("SCHEME", scheme.to_string());
    values.insert("CLIENT_IP", client_ip.to_string());
    values.insert("TIME", now.clone());
    values.insert("DATE", now);
    values.insert("URL", format!("{scheme}://{host}{path}"));
    values.insert("USER_AGENT", user_agent.to_string());
    values.insert("ROUTE_ID", item.route_id.clone());
    substitute_placeholders(&item.body, &values)
}

pub async fn serve(session: &mut Session, item: &RawSimpleResItem, host: &str, path: &str, method: &str) -> Result<()> {
    let query = session.req_header().uri.query().unwrap_or("");
    let user_agent = session
        .req_header()
        .headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let client_ip = session
        .client_addr()
        .and_then(|a| a.as_inet())
        .map(|i| i.ip().to_string())
        .unwrap_or_default();

    let body = if item.show_req {
        dump_request(session, host, path, method, query)
    } else {
        render_body(item, host, path, method, query, "http", &client_ip, user_agent)
    };
    let body = body.into_bytes();

    let accept_encoding = session
        .req_header()
        .headers
        .get("accept-encoding")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let encoding = compression::negotiate(&accept_encoding, &item.content_type, body.len());
    let body = compression::compress(encoding, &body)
        .await
        .unwrap_or(body);

    let mut header = ResponseHeader::build(item.status_code, None)?;
    header.insert_header("content-type", &item.content_type)?;
    header.insert_header("content-length", body.len().to_string())?;
    if let Some(enc) = encoding.as_header_value() {
        header.insert_header("content-encoding", enc)?;
    }
    for (k, v) in &item.headers {
        header.insert_header(k.clone(), v)?;
    }
    session.write_response_header(Box::new(header), false).await?;
    session.write_response_body(body.into(), true).await?;
    Ok(())
}

fn dump_request(session: &Session, host: &str, path: &str, method: &str, query: &str) -> String {
    let mut out = format!("{method} {path}{}{query} HTTP\nHost: {host}\n", if query.is_empty() { "" } else { "?" });
    for (name, value) in session.req_header().headers.iter() {
        out.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> RawSimpleResItem {
        RawSimpleResItem {
            route_id: "r1".to_string(),
            body: "hello {HOST}{PATH}".to_string(),
            status_code: 200,
            content_type: "text/plain".to_string(),
            headers: HashMap::new(),
            show_req: false,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let rendered = render_body(&item(), "example.com", "/ping", "GET", "", "https", "1.2.3.4", "curl");
        assert_eq!(rendered, "hello example.com/ping");
    }

    #[test]
    fn unknown_placeholder_passes_through_literally() {
        let mut i = item();
        i.body = "value={UNKNOWN_TOKEN}".to_string();
        let rendered = render_body(&i, "h", "/", "GET", "", "http", "", "");
        assert_eq!(rendered, "value={UNKNOWN_TOKEN}");
    }

    #[test]
    fn route_id_placeholder_resolves() {
        let mut i = item();
        i.body = "route={ROUTE_ID}".to_string();
        let rendered = render_body(&i, "h", "/", "GET", "", "http", "", "");
        assert_eq!(rendered, "route=r1");
    }
}
