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

pub mod dsl;
pub mod graph;
pub mod model;
pub mod normalize;

use std::path::Path;

use tracing::{info, warn};

use crate::errors::{GatewayError, GatewayResult};
use graph::RoutingGraph;
use model::RawConfig;

/// Loads a config file from disk, picking the parser by extension: `.ly`
/// goes through the DSL lexer/parser, anything else is treated as the
/// structured `serde_yaml` form.
pub fn load_file(path: &Path) -> GatewayResult<RoutingGraph> {
    let contents = std::fs::read_to_string(path)?;
    let file_name = path.to_string_lossy().to_string();

    let raw = if path.extension().and_then(|e| e.to_str()) == Some("ly") {
        let root = dsl::parse_str(&contents, &file_name)?;
        normalize::node_to_raw_config(&root)?
    } else {
        parse_structured(&contents, &file_name)?
    };

    let graph = normalize::normalize(raw)?;
    info!(
        listeners = graph.listeners.len(),
        routes = graph.routes.len(),
        clusters = graph.clusters.len(),
        "config loaded"
    );
    warn_on_exposed_control_plane(&graph);
    Ok(graph)
}

fn parse_structured(contents: &str, file_name: &str) -> GatewayResult<RawConfig> {
    serde_yaml::from_str(contents).map_err(|e| GatewayError::ConfigSyntax {
        file: file_name.to_string(),
        line: e.location().map(|l| l.line()).unwrap_or(0),
        message: e.to_string(),
    })
}

fn warn_on_exposed_control_plane(graph: &RoutingGraph) {
    if let Some(addr) = &graph.control_plane_addr {
        let is_loopback = addr.starts_with("127.0.0.1") || addr.starts_with("[::1]") || addr.starts_with("localhost");
        if !is_loopback {
            warn!(%addr, "control plane is bound to a non-loopback address");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_dsl_file_by_extension() {
        let mut tmp = tempfile_with_ext("ly");
        writeln!(
            tmp,
            "listen 0.0.0.0 {{\n  port = 8080\n}}\nroute home {{\n  path = \"/*\"\n}}\n"
        )
        .unwrap();
        let graph = load_file(tmp.path()).unwrap();
        assert_eq!(graph.listeners.len(), 1);
        assert_eq!(graph.routes.len(), 1);
    }

    #[test]
    fn loads_yaml_file_by_default() {
        let mut tmp = tempfile_with_ext("yaml");
        writeln!(
            tmp,
            "listens:\n  - host: 0.0.0.0\n    port: 8080\nroutes: []\nclusters: []\n"
        )
        .unwrap();
        let graph = load_file(tmp.path()).unwrap();
        assert_eq!(graph.listeners.len(), 1);
    }

    fn tempfile_with_ext(ext: &str) -> NamedTempFileAt {
        NamedTempFileAt::new(ext)
    }

    /// Minimal stand-in for a named temp file so tests don't pull in an
    /// extra dev-dependency just for suffix control.
    struct NamedTempFileAt {
        path: std::path::PathBuf,
        file: std::fs::File,
    }

    impl NamedTempFileAt {
        fn new(ext: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("gateway-test-{}-{}.{}", std::process::id(), rand_suffix(), ext));
            let file = std::fs::File::create(&path).unwrap();
            NamedTempFileAt { path, file }
        }

        fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl Write for NamedTempFileAt {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.file.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.file.flush()
        }
    }

    impl Drop for NamedTempFileAt {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }
}
