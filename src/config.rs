use std::time::Duration;

use clap::Parser;

use crate::error::{BridgeError, Result};
use crate::ingest::IngestPaths;
use crate::republish::RepublishSettings;
use crate::server::parse_endpoint;
use crate::source::NodePath;

/// Bridges one upstream data source to a local variable server and a UDP feed.
#[derive(Parser, Debug, Clone)]
#[command(name = "plc-bridge", version, about, long_about = None)]
pub struct Config {
    /// Upstream variable server endpoint.
    #[arg(
        long,
        env = "BRIDGE_UPSTREAM_URL",
        default_value = "ws://127.0.0.1:53530/OPCUA/SimulationServer"
    )]
    pub upstream_url: String,

    /// Poll the built-in simulation instead of a remote upstream.
    #[arg(long, env = "BRIDGE_SIMULATE")]
    pub simulate: bool,

    #[arg(long, env = "BRIDGE_COUNTER_PATH", default_value = "0:Objects/3:Simulation/3:Counter")]
    pub counter_path: String,

    #[arg(long, env = "BRIDGE_RANDOM_PATH", default_value = "0:Objects/3:Simulation/3:Random")]
    pub random_path: String,

    /// Variable whose value is republished on the local server.
    #[arg(long, env = "BRIDGE_DERIVED_PATH", default_value = "0:Objects/3:Simulation/3:Senoidal")]
    pub derived_path: String,

    /// Endpoint the local variable server binds to.
    #[arg(long, env = "BRIDGE_SERVER_ENDPOINT", default_value = "ws://0.0.0.0:4840/bridge/server/")]
    pub server_endpoint: String,

    #[arg(long, env = "BRIDGE_NAMESPACE_URI", default_value = "urn:plc-bridge:republish")]
    pub namespace_uri: String,

    #[arg(long, env = "BRIDGE_OBJECT_NAME", default_value = "Bridge")]
    pub object_name: String,

    #[arg(long, env = "BRIDGE_VARIABLE_NAME", default_value = "Derived")]
    pub variable_name: String,

    /// Host receiving the forwarded datagrams.
    #[arg(long, env = "BRIDGE_FORWARD_HOST", default_value = "127.0.0.1")]
    pub forward_host: String,

    #[arg(long, env = "BRIDGE_FORWARD_PORT", default_value_t = 5005)]
    pub forward_port: u16,

    #[arg(long, env = "BRIDGE_INGEST_INTERVAL_MS", default_value_t = 50)]
    pub ingest_interval_ms: u64,

    #[arg(long, env = "BRIDGE_REPUBLISH_INTERVAL_MS", default_value_t = 100)]
    pub republish_interval_ms: u64,

    #[arg(long, env = "BRIDGE_FORWARD_INTERVAL_MS", default_value_t = 50)]
    pub forward_interval_ms: u64,

    #[arg(long, env = "BRIDGE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for workers at shutdown.
    #[arg(long, env = "BRIDGE_SHUTDOWN_TIMEOUT_MS", default_value_t = 3000)]
    pub shutdown_timeout_ms: u64,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("ingest_interval_ms", self.ingest_interval_ms),
            ("republish_interval_ms", self.republish_interval_ms),
            ("forward_interval_ms", self.forward_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(BridgeError::Config(format!("{name} must be greater than zero")));
        }
        if self.forward_host.is_empty() {
            return Err(BridgeError::Config("forward_host must not be empty".to_string()));
        }
        if !self.simulate {
            parse_endpoint(&self.upstream_url)?;
        }
        parse_endpoint(&self.server_endpoint)?;
        self.ingest_paths()?;
        Ok(())
    }

    pub fn ingest_paths(&self) -> Result<IngestPaths> {
        Ok(IngestPaths {
            counter: self.counter_path.parse::<NodePath>()?,
            random: self.random_path.parse::<NodePath>()?,
            derived: self.derived_path.parse::<NodePath>()?,
        })
    }

    pub fn republish_settings(&self) -> RepublishSettings {
        RepublishSettings {
            endpoint: self.server_endpoint.clone(),
            namespace_uri: self.namespace_uri.clone(),
            object_name: self.object_name.clone(),
            variable_name: self.variable_name.clone(),
            interval: self.republish_interval(),
        }
    }

    /// `host:port`, bracketing bare IPv6 hosts.
    pub fn forward_destination(&self) -> String {
        if self.forward_host.contains(':') && !self.forward_host.starts_with('[') {
            format!("[{}]:{}", self.forward_host, self.forward_port)
        } else {
            format!("{}:{}", self.forward_host, self.forward_port)
        }
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms)
    }

    pub fn forward_interval(&self) -> Duration {
        Duration::from_millis(self.forward_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
