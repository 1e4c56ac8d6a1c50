//! Log output and node attribution.
//!
//! Logs from several nodes usually end up side by side, so everything a node
//! does runs inside a [`node_span`] naming its role and 16-bit id. Connection
//! tasks spawned under that span keep it.

use std::sync::OnceLock;
use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::{NodePrefix, ObservabilityConfig};

/// Environment switch for JSON output, honoured even when the config
/// leaves `json_logs` off.
pub const LOG_FORMAT_ENV: &str = "DCL_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn resolve(config: &ObservabilityConfig) -> Self {
        let env = std::env::var(LOG_FORMAT_ENV).ok();
        Self::choose(config.json_logs, env.as_deref())
    }

    fn choose(json_logs: bool, env: Option<&str>) -> Self {
        if json_logs || env.is_some_and(|v| v.eq_ignore_ascii_case("json")) {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }
}

/// Which side of the cluster a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Compute,
    Client,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Compute => "compute",
            NodeRole::Client => "client",
        }
    }
}

/// `RUST_LOG` wins; otherwise the configured level, or `info` when that
/// does not parse.
fn filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

static INSTALLED: OnceLock<LogFormat> = OnceLock::new();

/// Install the process-wide subscriber.
///
/// Only the first call installs anything; every call returns the format that
/// call chose.
pub fn init_tracing(config: &ObservabilityConfig) -> LogFormat {
    *INSTALLED.get_or_init(|| {
        let format = LogFormat::resolve(config);
        let registry = tracing_subscriber::registry().with(filter(config));
        let installed = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(true))
                .try_init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        };
        if let Err(err) = installed {
            eprintln!("tracing init skipped: {err}");
        }
        format
    })
}

pub fn node_span(role: NodeRole, node: NodePrefix) -> Span {
    tracing::info_span!("node", role = role.as_str(), node_id = node.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_from_config_or_env() {
        assert_eq!(LogFormat::choose(false, None), LogFormat::Compact);
        assert_eq!(LogFormat::choose(true, None), LogFormat::Json);
        assert_eq!(LogFormat::choose(false, Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::choose(false, Some("text")), LogFormat::Compact);
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_node_span_tags_events() {
        let span = node_span(NodeRole::Compute, NodePrefix(7));
        span.in_scope(|| tracing::info!("device available"));
        assert!(logs_contain("node_id=7"));
        assert!(logs_contain("device available"));
    }
}
