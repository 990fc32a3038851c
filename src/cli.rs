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

//! CLI surface: `clap`-derived subcommands for running the gateway, quick
//! one-off testing modes (`file`/`proxy`/`respond`), control-plane commands
//! (`stop`/`reload`), config validation, and environment inspection.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "edge-gateway", about = "multi-protocol edge gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the gateway against a structured or DSL config file.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Alias for `run`.
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Runs only the static file server component against one root.
    File {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Runs a bare reverse-proxy to a single upstream, for quick testing.
    Proxy {
        #[arg(long)]
        upstream: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Serves a single canned response, for quick testing.
    Respond {
        #[arg(long)]
        body: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Sends `/api/stop` to a running instance's control plane.
    Stop {
        #[arg(long, default_value = "127.0.0.1:7030")]
        control_plane: String,
    },
    /// Sends `/api/reload` to a running instance's control plane.
    Reload {
        #[arg(long, default_value = "127.0.0.1:7030")]
        control_plane: String,
    },
    /// Parses and normalizes a config file without starting any listener.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Prints the resolved environment (`.env` + process env) the gateway
    /// would start with, for debugging config layering.
    Environ,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_config_flag() {
        let cli = Cli::parse_from(["edge-gateway", "run", "--config", "gateway.yaml"]);
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from("gateway.yaml")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn validate_requires_config() {
        let result = Cli::try_parse_from(["edge-gateway", "validate"]);
        assert!(result.is_err());
    }

    #[test]
    fn file_defaults_port_to_8080() {
        let cli = Cli::parse_from(["edge-gateway", "file", "--root", "/srv/www"]);
        match cli.command {
            Command::File { port, .. } => assert_eq!(port, 8080),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
