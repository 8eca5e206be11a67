// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use super::CliOpts;
use directories::ProjectDirs;
use grove_utils::{read_file_to_string, read_toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The declarative configuration document. Every key can be overridden by
/// a correspondingly named `GROVE_<SECTION>_<KEY>` environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub cluster: ClusterConfig,
    pub discovery: DiscoveryConfig,
    pub consensus: ConsensusSection,
    pub networking: NetworkingConfig,
    pub roles: RolesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `identity.json`.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Text-encoded admission secret. When empty, `cluster.key` in the
    /// data directory is read instead.
    pub auth_key: String,
    pub name: String,
    pub region: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub node_name: String,
    /// Base64 32-byte gossip transport key. When empty, `serf.key` in the
    /// data directory is read if present.
    pub encrypt_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub bind_addr: String,
    pub bind_port: u16,
    /// Only true for the very first node of a brand-new cluster.
    pub bootstrap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    pub interface: String,
    pub listen_port: u16,
    pub subnet: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub enabled: Vec<String>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Capabilities {
    pub cpu: Option<u64>,
    pub ram: Option<u64>,
    pub gpu: Option<u64>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("io", "grove", "grove")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/grove"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity: IdentityConfig::default(),
            cluster: ClusterConfig::default(),
            discovery: DiscoveryConfig::default(),
            consensus: ConsensusSection::default(),
            networking: NetworkingConfig::default(),
            roles: RolesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            path: default_data_dir(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            auth_key: String::new(),
            name: "grove".to_string(),
            region: "default".to_string(),
            datacenter: "dc1".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7946,
            bootstrap_peers: Vec::new(),
            node_name: grove_utils::machine_hostname(),
            encrypt_key: String::new(),
        }
    }
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7373,
            bootstrap: false,
        }
    }
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        NetworkingConfig {
            interface: "grove0".to_string(),
            listen_port: 51820,
            subnet: "10.42.0.0/16".to_string(),
            mtu: None,
        }
    }
}

impl Default for RolesConfig {
    fn default() -> Self {
        RolesConfig {
            enabled: Vec::new(),
            capabilities: Capabilities::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stderr".to_string(),
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> &Path {
        &self.identity.path
    }
}

/// Resolve the admission secret: the config value when set, otherwise the
/// `cluster.key` file in the data directory.
pub fn resolve_cluster_secret(
    config: &Config,
) -> Result<grove_admission::ClusterSecret, grove_admission::Error> {
    let text = if config.cluster.auth_key.is_empty() {
        read_file_to_string(&config.data_dir().join("cluster.key"))
            .map_err(|_| grove_admission::Error::SecretMissing)?
    } else {
        config.cluster.auth_key.clone()
    };
    grove_admission::ClusterSecret::decode(&text)
}

/// Resolve the gossip transport key: the config value when set, otherwise
/// the `serf.key` file in the data directory if present.
pub fn resolve_gossip_key(config: &Config) -> Option<String> {
    if !config.discovery.encrypt_key.is_empty() {
        return Some(config.discovery.encrypt_key.clone());
    }
    read_file_to_string(&config.data_dir().join("serf.key"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Load the configuration: file (if given), then environment overrides,
/// then CLI overrides.
pub fn load_config(opts: &CliOpts) -> Result<Config, anyhow::Error> {
    let mut config = match &opts.config {
        Some(path) => {
            let toml_string = read_file_to_string(Path::new(path))?;
            read_toml(&toml_string)?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config)?;
    if let Some(data_dir) = &opts.data_dir {
        config.identity.path = PathBuf::from(data_dir);
    }
    Ok(config)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn apply_env_overrides(config: &mut Config) -> Result<(), anyhow::Error> {
    if let Some(v) = env_var("GROVE_IDENTITY_PATH") {
        config.identity.path = PathBuf::from(v);
    }
    if let Some(v) = env_var("GROVE_CLUSTER_AUTH_KEY") {
        config.cluster.auth_key = v;
    }
    if let Some(v) = env_var("GROVE_CLUSTER_NAME") {
        config.cluster.name = v;
    }
    if let Some(v) = env_var("GROVE_CLUSTER_REGION") {
        config.cluster.region = v;
    }
    if let Some(v) = env_var("GROVE_CLUSTER_DATACENTER") {
        config.cluster.datacenter = v;
    }
    if let Some(v) = env_var("GROVE_DISCOVERY_BIND_ADDR") {
        config.discovery.bind_addr = v;
    }
    if let Some(v) = env_var("GROVE_DISCOVERY_BIND_PORT") {
        config.discovery.bind_port = v.parse()?;
    }
    if let Some(v) = env_var("GROVE_DISCOVERY_BOOTSTRAP_PEERS") {
        config.discovery.bootstrap_peers =
            v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = env_var("GROVE_DISCOVERY_NODE_NAME") {
        config.discovery.node_name = v;
    }
    if let Some(v) = env_var("GROVE_DISCOVERY_ENCRYPT_KEY") {
        config.discovery.encrypt_key = v;
    }
    if let Some(v) = env_var("GROVE_CONSENSUS_BIND_ADDR") {
        config.consensus.bind_addr = v;
    }
    if let Some(v) = env_var("GROVE_CONSENSUS_BIND_PORT") {
        config.consensus.bind_port = v.parse()?;
    }
    if let Some(v) = env_var("GROVE_CONSENSUS_BOOTSTRAP") {
        config.consensus.bootstrap = v.parse()?;
    }
    if let Some(v) = env_var("GROVE_NETWORKING_INTERFACE") {
        config.networking.interface = v;
    }
    if let Some(v) = env_var("GROVE_NETWORKING_LISTEN_PORT") {
        config.networking.listen_port = v.parse()?;
    }
    if let Some(v) = env_var("GROVE_NETWORKING_SUBNET") {
        config.networking.subnet = v;
    }
    if let Some(v) = env_var("GROVE_NETWORKING_MTU") {
        config.networking.mtu = Some(v.parse()?);
    }
    if let Some(v) = env_var("GROVE_ROLES_ENABLED") {
        config.roles.enabled = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = env_var("GROVE_LOGGING_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = env_var("GROVE_LOGGING_FORMAT") {
        config.logging.format = v;
    }
    if let Some(v) = env_var("GROVE_LOGGING_OUTPUT") {
        config.logging.output = v;
    }
    Ok(())
}
