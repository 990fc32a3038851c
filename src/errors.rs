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

use thiserror::Error;

/// Errors raised outside the pingora-owned L7 path: config loading, the DSL
/// parser, the forward/stream proxies, the CC analyser and the control
/// plane. The pingora proxy stages keep using `pingora::Error` directly.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config syntax error at {file}:{line}: {message}")]
    ConfigSyntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("config conflict: {0}")]
    ConfigConflict(String),

    #[error("route {0} has no matching cluster")]
    UnresolvedCluster(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("request body too large")]
    BodyTooLarge,
}

pub type GatewayResult<T> = Result<T, GatewayError>;
