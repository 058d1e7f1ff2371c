//! Generated node configuration for local clusters
//!
//! Node `i` listens on every default port shifted by `i * PORT_JUMP`, so the
//! first node's query interface is on `:8186`, the second on `:8286`, and so on.

use crate::meta::NodeRole;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Gap between ports on different nodes, e.g. 8188, 8288, 8388
pub const PORT_JUMP: i64 = 100;

pub const DEFAULT_RAFT_BIND_ADDRESS: &str = ":8088";
pub const DEFAULT_META_HTTP_BIND_ADDRESS: &str = ":8091";
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = ":8086";

/// Configuration file handed to one node process with `-config=<path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub reporting_disabled: bool,
    pub bind_address: String,
    #[serde(default)]
    pub join: String,
    pub meta: MetaSection,
    pub data: DataSection,
    pub http: HttpSection,
    pub hinted_handoff: HintedHandoffSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaSection {
    pub enabled: bool,
    #[serde(default)]
    pub dir: String,
    pub bind_address: String,
    pub http_bind_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataSection {
    pub enabled: bool,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub wal_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpSection {
    pub bind_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HintedHandoffSection {
    pub enabled: bool,
}

impl NodeConfig {
    /// Configuration for node number `number` (1-based) rooted at `base`.
    pub fn new(base: &Path, number: u32, role: NodeRole) -> Result<Self> {
        if number == 0 {
            return Err(Error::Config(format!(
                "invalid node number {}; must be >= 1",
                number
            )));
        }
        let delta = number as i64 * PORT_JUMP;
        let meta_bind = shift_port(DEFAULT_RAFT_BIND_ADDRESS, delta)?;
        let meta_http = shift_port(DEFAULT_META_HTTP_BIND_ADDRESS, delta)?;

        let mut config = Self {
            reporting_disabled: true,
            bind_address: meta_bind.clone(),
            join: String::new(),
            meta: MetaSection {
                enabled: false,
                dir: String::new(),
                bind_address: meta_bind,
                http_bind_address: meta_http,
            },
            data: DataSection {
                enabled: false,
                dir: String::new(),
                wal_dir: String::new(),
            },
            http: HttpSection {
                bind_address: shift_port(DEFAULT_HTTP_BIND_ADDRESS, delta)?,
            },
            hinted_handoff: HintedHandoffSection { enabled: false },
        };

        if role.serves_meta() {
            config.meta.enabled = true;
            config.meta.dir = path_string(base.join("meta"));
        }
        if role.serves_data() {
            config.data.enabled = true;
            config.data.dir = path_string(base.join("data"));
            config.data.wal_dir = path_string(base.join("wal"));
        }
        Ok(config)
    }

    pub fn with_join(mut self, join: impl Into<String>) -> Self {
        self.join = join.into();
        self
    }

    /// Address of the query interface as seen from the harness host.
    pub fn query_addr(&self) -> String {
        format!("localhost{}", self.http.bind_address)
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data.enabled.then(|| PathBuf::from(&self.data.dir))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

/// Shift the port of a `host:port`, `:port` or bare `port` address by `delta`.
///
/// `shift_port(":8080", 300)` is `":8380"`.
pub fn shift_port(addr: &str, delta: i64) -> Result<String> {
    let parts: Vec<&str> = addr.split(':').collect();
    if parts.len() > 2 {
        return Err(Error::Config(format!("cannot parse {:?}", addr)));
    }
    let port = parse_port(addr, parts[parts.len() - 1])?;
    let shifted = port + delta;

    if parts.len() == 1 {
        Ok(shifted.to_string())
    } else {
        Ok(format!("{}:{}", parts[0], shifted))
    }
}

/// Port number of a `host:port`, `:port` or bare `port` string.
pub fn ptoi(addr: &str) -> Result<i64> {
    let last = addr.rsplit(':').next().unwrap_or(addr);
    parse_port(addr, last)
}

fn parse_port(addr: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| Error::Config(format!("cannot extract port from {:?}: {}", addr, e)))
}

/// Join argument listing the meta HTTP address of the first `n` nodes.
pub fn generate_join_arg(n: u32, seed_port: i64) -> String {
    (1..=n as i64)
        .map(|i| format!("localhost:{}", seed_port + i * PORT_JUMP))
        .collect::<Vec<_>>()
        .join(",")
}
