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

//! SOCKS5 forward-proxy mode (RFC 1928/1929): greeting, optional
//! username/password auth negotiation, the CONNECT command, and REP code
//! mapping from the upstream connect's `io::Error`. BIND and UDP ASSOCIATE
//! are refused with `0x07` (command not supported) since the gateway only
//! proxies outbound TCP streams.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::is_host_allowed;
use crate::config::model::RawForwardProxyConfig;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub async fn handle(mut client: TcpStream, config: &RawForwardProxyConfig) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION {
        return Ok(());
    }
    let nmethods = greeting[1] as usize;
    let mut methods = vec![0u8; nmethods];
    client.read_exact(&mut methods).await?;

    let chosen = if config.require_auth {
        if methods.contains(&METHOD_USERPASS) {
            METHOD_USERPASS
        } else {
            METHOD_NONE_ACCEPTABLE
        }
    } else if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NONE_ACCEPTABLE
    };
    client.write_all(&[VERSION, chosen]).await?;
    if chosen == METHOD_NONE_ACCEPTABLE {
        return Ok(());
    }

    if chosen == METHOD_USERPASS && !negotiate_userpass(&mut client, config).await? {
        return Ok(());
    }

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    let (version, cmd, _rsv, atyp) = (header[0], header[1], header[2], header[3]);
    if version != VERSION {
        return Ok(());
    }

    let target_host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets)).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await?;
            let mut name = vec![0u8; len_buf[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets)).to_string()
        }
        _ => {
            send_reply(&mut client, 0x08).await?;
            return Ok(());
        }
    };
    let mut port_buf = [0u8; 2];
    client.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    if cmd != CMD_CONNECT {
        send_reply(&mut client, 0x07).await?;
        return Ok(());
    }

    if !is_host_allowed(config, &target_host) {
        send_reply(&mut client, 0x02).await?;
        return Ok(());
    }

    match TcpStream::connect((target_host.as_str(), port)).await {
        Ok(mut upstream) => {
            send_reply(&mut client, 0x00).await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        Err(err) => {
            send_reply(&mut client, rep_code_for_error(&err)).await?;
        }
    }
    Ok(())
}

async fn negotiate_userpass(client: &mut TcpStream, config: &RawForwardProxyConfig) -> std::io::Result<bool> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    let ulen = header[1] as usize;
    let mut user = vec![0u8; ulen];
    client.read_exact(&mut user).await?;
    let mut plen_buf = [0u8; 1];
    client.read_exact(&mut plen_buf).await?;
    let mut pass = vec![0u8; plen_buf[0] as usize];
    client.read_exact(&mut pass).await?;

    let username = String::from_utf8_lossy(&user).to_string();
    let password = String::from_utf8_lossy(&pass).to_string();
    let ok = config.credentials.get(&username).map(|p| p == &password).unwrap_or(false);

    client.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    Ok(ok)
}

/// Maps a connect-attempt error to the closest SOCKS5 REP code.
fn rep_code_for_error(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind::*;
    match err.kind() {
        ConnectionRefused => 0x05,
        TimedOut => 0x06,
        NotFound | AddrNotAvailable => 0x04,
        PermissionDenied => 0x02,
        _ => 0x01,
    }
}

async fn send_reply(client: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    let mut reply = vec![VERSION, rep, 0x00, ATYP_IPV4];
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&[0, 0]);
    client.write_all(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_connection_refused_to_rep_05() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(rep_code_for_error(&err), 0x05);
    }

    #[test]
    fn maps_timeout_to_rep_06() {
        let err = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(rep_code_for_error(&err), 0x06);
    }

    #[test]
    fn unrecognized_error_maps_to_general_failure() {
        let err = std::io::Error::from(std::io::ErrorKind::Other);
        assert_eq!(rep_code_for_error(&err), 0x01);
    }
}
