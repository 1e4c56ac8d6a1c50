//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and environment variables. The
//! listening endpoint and the node list path are the only items a deployment
//! must provide; everything else has a default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};

/// Port a daemon listens on when the node list omits one.
pub const DEFAULT_PORT: u16 = 25025;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and endpoints.
    #[serde(default)]
    pub node: NodeConfig,

    /// Messaging layer configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Event and listener fabric configuration.
    #[serde(default)]
    pub fabric: FabricConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::config(format!("invalid config {}: {}", path.display(), e))
                })?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DCL_NODE_ID`, `DCL_LISTEN_ADDR` and `DCL_NODE_LIST`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("DCL_NODE_ID") {
            self.node.node_id = raw
                .parse()
                .map_err(|_| Error::config(format!("DCL_NODE_ID is not a u16: {}", raw)))?;
        }
        if let Ok(addr) = std::env::var("DCL_LISTEN_ADDR") {
            self.node.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("DCL_NODE_LIST") {
            self.node.node_list = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transport;
        if t.max_frame_bytes < 1 {
            return Err(Error::config("transport.max_frame_bytes must be at least 1"));
        }
        if t.send_queue_capacity == 0 || t.inbound_queue_capacity == 0 {
            return Err(Error::config("transport queue capacities must be positive"));
        }
        if t.handler_workers == 0 {
            return Err(Error::config("transport.handler_workers must be positive"));
        }
        if t.max_connections == 0 {
            return Err(Error::config("transport.max_connections must be positive"));
        }
        Ok(())
    }
}

/// Node identity and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 16-bit identifier prefix. Must be unique per node in a cluster.
    pub node_id: u16,

    /// Daemon bind address (TCP).
    pub listen_addr: String,

    /// Path of the node list file read by clients.
    #[serde(default)]
    pub node_list: Option<PathBuf>,

    /// Device names exposed by the reference driver.
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
}

fn default_devices() -> Vec<String> {
    vec!["reference-device-0".to_string()]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            node_list: None,
            devices: default_devices(),
        }
    }
}

/// Messaging layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum frame size (kind byte plus payload) in bytes.
    pub max_frame_bytes: u32,

    /// Outbound frames queued per connection before senders wait
    /// (the high-water mark).
    pub send_queue_capacity: usize,

    /// Inbound requests and notifications queued per connection before the
    /// reader stops pulling from the socket.
    pub inbound_queue_capacity: usize,

    /// Request handlers allowed to run concurrently on a node.
    pub handler_workers: usize,

    /// Maximum concurrent accepted connections.
    pub max_connections: usize,

    /// Default request deadline. `None` waits until the response or
    /// connection loss.
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-frame write timeout. Peers that cannot accept a frame within this
    /// window are disconnected.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// What to do when a peer connection is lost.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024 * 1024,
            send_queue_capacity: 256,
            inbound_queue_capacity: 256,
            handler_workers: 16,
            max_connections: 1000,
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnect policy for client-side peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Surface `CONNECTION_LOST` and stay disconnected.
    Never,
    /// Re-establish once per request after `backoff`, then resend.
    Once {
        #[serde(with = "humantime_serde")]
        backoff: Duration,
    },
}

impl ReconnectPolicy {
    pub fn allows_reconnect(&self) -> bool {
        matches!(self, ReconnectPolicy::Once { .. })
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Once {
            backoff: Duration::from_millis(100),
        }
    }
}

/// Event and listener fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Window in which identical context errors from several nodes are
    /// coalesced into one listener call.
    #[serde(with = "humantime_serde")]
    pub context_error_window: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            context_error_window: Duration::from_millis(500),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// One entry of the node list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(Error::config("empty node address"));
        }
        match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| Error::config(format!("invalid port in node address: {}", entry)))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(Error::config(format!("missing host in node address: {}", entry))),
            None => Ok(Self::new(entry, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Read a node list: one `host[:port]` per line, `#` starts a comment.
pub fn load_node_list(path: &Path) -> Result<Vec<NodeAddress>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read node list {}: {}", path.display(), e)))?;
    parse_node_list(&raw)
}

pub fn parse_node_list(raw: &str) -> Result<Vec<NodeAddress>> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(NodeAddress::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list(
            "# cluster\nnode-a:4000\n\n  node-b   # default port\n10.0.0.3:25026\n",
        )
        .unwrap();
        assert_eq!(
            nodes,
            vec![
                NodeAddress::new("node-a", 4000),
                NodeAddress::new("node-b", DEFAULT_PORT),
                NodeAddress::new("10.0.0.3", 25026),
            ]
        );
    }

    #[test]
    fn test_parse_node_list_rejects_bad_port() {
        assert!(parse_node_list("node-a:http\n").is_err());
        assert!(parse_node_list(":4000\n").is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node": {{ "node_id": 3, "listen_addr": "0.0.0.0:4000" }},
                "transport": {{
                    "max_frame_bytes": 1024,
                    "send_queue_capacity": 8,
                    "inbound_queue_capacity": 8,
                    "handler_workers": 2,
                    "max_connections": 4,
                    "request_timeout": "2s",
                    "connect_timeout": "500ms",
                    "write_timeout": "1s",
                    "reconnect": {{ "mode": "never" }}
                }},
                "fabric": {{ "context_error_window": "50ms" }}
            }}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node.node_id, 3);
        assert_eq!(config.node.devices, default_devices());
        assert_eq!(config.transport.request_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.transport.reconnect, ReconnectPolicy::Never);
        assert_eq!(config.fabric.context_error_window, Duration::from_millis(50));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/dcl.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.transport.handler_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_node_list_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gpu-01\ngpu-02:26000").unwrap();
        let nodes = load_node_list(file.path()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].to_string(), "gpu-02:26000");
    }
}
