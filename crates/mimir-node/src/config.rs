use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use mimir_cache::CacheConfig;
use mimir_consensus::RaftConfig;
use mimir_server::{AdmissionConfig, ServerConfig};
use mimir_storage::RetentionPolicy;
use mimir_types::NodeId;

const DEFAULTS: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct RetentionConfig {
    pub max_versions: u64,
    pub max_age_secs: u64,
    pub interval_secs: u64,
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_versions: self.max_versions,
            max_age_ms: i64::try_from(self.max_age_secs.saturating_mul(1_000)).unwrap_or(i64::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub raft: RaftConfig,
    pub retention: RetentionConfig,
    pub cache: CacheConfig,
    pub admission: AdmissionConfig,
    pub server: ServerConfig,
    pub observability: ObservabilityConfig,
}

/// Built-in defaults, then the optional file, then `MIMIR_*` variables.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut figment = Figment::new().merge(Toml::string(DEFAULTS));
    if let Some(path) = path {
        figment = figment.merge(Toml::file_exact(path));
    }
    let config: Config = figment
        .merge(Env::prefixed("MIMIR_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.raft.validate().context("invalid raft configuration")?;
    Ok(config)
}

/// Parse repeated `--peer id=addr` flags.
pub fn parse_peers(specs: &[String]) -> anyhow::Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::with_capacity(specs.len());
    for spec in specs {
        let (id, addr) = spec
            .split_once('=')
            .with_context(|| format!("peer {spec:?} is not in id=addr form"))?;
        let id: NodeId = id
            .trim()
            .parse()
            .with_context(|| format!("peer {spec:?} has a non-numeric id"))?;
        let addr = addr.trim();
        if addr.is_empty() {
            bail!("peer {spec:?} has an empty address");
        }
        if peers.insert(id, addr.to_string()).is_some() {
            bail!("peer {id} given twice");
        }
    }
    Ok(peers)
}
