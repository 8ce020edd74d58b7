use std::{collections::BTreeMap, fs, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    common::error::ConfigError,
    consensus::{
        admission::AdmissionRule,
        ledger::STARTING_BALANCE,
        message::NodeId,
        peers::{default_ports, Topology},
    },
};

/// Exponential back-off for dialing peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: u32,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_ms: 100,
            max_ms: 10_000,
            factor: 2,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: NodeId,
    pub host: String,
    pub ports: BTreeMap<NodeId, u16>,
    pub data_dir: PathBuf,
    pub starting_balance: i64,
    pub admission: AdmissionRule,
    pub round_timeout_ms: u64,
    pub max_round_attempts: u32,
    pub retry_jitter_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 1,
            host: "127.0.0.1".to_string(),
            ports: default_ports(),
            data_dir: PathBuf::from("data"),
            starting_balance: STARTING_BALANCE,
            admission: AdmissionRule::default(),
            round_timeout_ms: 2_000,
            max_round_attempts: 5,
            retry_jitter_ms: 50,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn for_node(node_id: NodeId) -> Self {
        Config {
            node_id,
            ..Config::default()
        }
    }

    /// Reads a JSON config; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn topology(&self) -> Result<Topology, ConfigError> {
        Topology::new(self.node_id, self.host.clone(), self.ports.clone())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }
}
