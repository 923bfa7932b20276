//! Engine configuration: interface, port policy, local IP, static peer list
//! and the post retry bound.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use naofi_types::{NaCode, Status};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for Status {
    fn from(err: ConfigError) -> Self {
        Status::with_message(NaCode::INVALID_PARAM, err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfiConfig {
    /// Network interface; matched against the provider's domain name.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Local IP the endpoints bind to.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Take ports from the base counters instead of letting the provider
    /// choose.
    #[serde(default)]
    pub port_consecutive: bool,

    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_base_port_client")]
    pub base_port_client: u16,

    /// Static peer list inserted into every non-psm2 domain at open.
    #[serde(default)]
    pub node_list_file: Option<PathBuf>,

    /// Upper bound on `Again` retries per post. `None` retries forever.
    #[serde(default)]
    pub post_retry_limit: Option<u32>,
}

fn default_interface() -> String {
    "lo".into()
}

fn default_ip() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    22222
}

fn default_base_port_client() -> u16 {
    33333
}

impl Default for OfiConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            ip: default_ip(),
            port_consecutive: false,
            base_port: default_base_port(),
            base_port_client: default_base_port_client(),
            node_list_file: None,
            post_retry_limit: None,
        }
    }
}

impl OfiConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: OfiConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".into()));
        }
        if self.ip.is_empty() {
            return Err(ConfigError::Invalid("ip must not be empty".into()));
        }
        if self.post_retry_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "post_retry_limit must be positive; omit it to retry forever".into(),
            ));
        }
        Ok(())
    }
}

/// Hands out listening and client ports under the consecutive policy.
#[derive(Debug)]
pub struct PortAllocator {
    consecutive: bool,
    listen: AtomicU16,
    client: AtomicU16,
}

impl PortAllocator {
    pub fn new(config: &OfiConfig) -> Self {
        Self {
            consecutive: config.port_consecutive,
            listen: AtomicU16::new(config.base_port),
            client: AtomicU16::new(config.base_port_client),
        }
    }

    /// Next port for an endpoint, or `None` when the provider should pick.
    pub fn next(&self, listen: bool) -> Option<u16> {
        if !self.consecutive {
            return None;
        }
        let counter = if listen { &self.listen } else { &self.client };
        Some(counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub host: String,
    pub service: String,
}

/// Parse a peer list: one `host:port` per line, `#` starts a comment.
pub fn parse_node_list(text: &str) -> Result<Vec<NodeEntry>, ConfigError> {
    let mut nodes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (host, service) = line.rsplit_once(':').ok_or_else(|| {
            ConfigError::Invalid(format!("node list line {}: expected host:port", lineno + 1))
        })?;
        if host.is_empty() || service.parse::<u16>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "node list line {}: bad entry {line:?}",
                lineno + 1
            )));
        }
        nodes.push(NodeEntry {
            host: host.to_string(),
            service: service.to_string(),
        });
    }
    Ok(nodes)
}

pub fn load_node_list(path: impl AsRef<Path>) -> Result<Vec<NodeEntry>, ConfigError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse_node_list(&text)
}
