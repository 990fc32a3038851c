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

//! Forward-proxy multiplexer: ports declared `forward_proxy = true` sniff
//! the first byte to decide between SOCKS5 and HTTP/CONNECT, then hand the
//! connection to the matching mode handler. Plain tokio listener, not a
//! pingora service, since sniffing ahead of any protocol parsing sits
//! outside what `ProxyHttp` models.

pub mod connect;
pub mod http;
pub mod socks5;

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::model::RawForwardProxyConfig;

pub struct ForwardProxyService {
    pub config: Arc<RawForwardProxyConfig>,
}

impl ForwardProxyService {
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, "forward proxy listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, config).await {
                            warn!(%peer, error = %err, "forward proxy connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, config: Arc<RawForwardProxyConfig>) -> std::io::Result<()> {
    let mut first_byte = [0u8; 1];
    let n = stream.peek(&mut first_byte).await?;
    if n == 0 {
        return Ok(());
    }

    if first_byte[0] == 0x05 {
        socks5::handle(stream, &config).await
    } else if first_byte[0].is_ascii_uppercase() {
        let mut probe = [0u8; 7];
        let n = stream.peek(&mut probe).await?;
        let probe_str = String::from_utf8_lossy(&probe[..n]);
        if probe_str.starts_with("CONNECT") {
            connect::handle(stream, &config).await
        } else {
            http::handle(stream, &config).await
        }
    } else {
        error!("unrecognized forward-proxy preamble byte {:#x}", first_byte[0]);
        Ok(())
    }
}

/// Decodes `Basic base64(user:pass)` from a `Proxy-Authorization` header.
pub fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    use base64::Engine;
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub fn is_authorized(config: &RawForwardProxyConfig, header_value: Option<&str>) -> bool {
    if !config.require_auth {
        return true;
    }
    let Some(value) = header_value else { return false };
    match decode_basic_auth(value) {
        Some((user, pass)) => config.credentials.get(&user).map(|p| p == &pass).unwrap_or(false),
        None => false,
    }
}

pub fn is_host_allowed(config: &RawForwardProxyConfig, host: &str) -> bool {
    if config.blocked_hosts.iter().any(|h| host_matches(h, host)) {
        return false;
    }
    config.allowed_hosts.is_empty() || config.allowed_hosts.iter().any(|h| host_matches(h, host))
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host.ends_with(&format!(".{suffix}")) || host == suffix
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(require_auth: bool) -> RawForwardProxyConfig {
        RawForwardProxyConfig {
            port: 8888,
            allowed_hosts: vec![],
            blocked_hosts: vec![],
            require_auth,
            credentials: HashMap::from([("alice".to_string(), "wonderland".to_string())]),
        }
    }

    #[test]
    fn basic_auth_decodes_user_and_pass() {
        let header = format!("Basic {}", {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode("alice:wonderland")
        });
        assert_eq!(decode_basic_auth(&header), Some(("alice".to_string(), "wonderland".to_string())));
    }

    #[test]
    fn authorization_required_and_correct() {
        let config = config(true);
        use base64::Engine;
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("alice:wonderland"));
        assert!(is_authorized(&config, Some(&header)));
    }

    #[test]
    fn authorization_required_but_missing() {
        let config = config(true);
        assert!(!is_authorized(&config, None));
    }

    #[test]
    fn no_auth_required_always_passes() {
        let config = config(false);
        assert!(is_authorized(&config, None));
    }

    #[test]
    fn blocked_host_wins_over_allowed() {
        let mut config = config(false);
        config.allowed_hosts = vec!["*.example.com".to_string()];
        config.blocked_hosts = vec!["evil.example.com".to_string()];
        assert!(!is_host_allowed(&config, "evil.example.com"));
        assert!(is_host_allowed(&config, "api.example.com"));
    }
}
