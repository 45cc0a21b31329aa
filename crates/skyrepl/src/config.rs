//! Runtime configuration: workers, database families and tunables.
//!
//! The configuration is shared as `Arc<Config>` and may be mutated at
//! runtime (worker decommission disables and eventually deletes workers).
//! A file-backed config persists every mutation; an in-memory config is
//! used by tests and embedded setups.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// One worker node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub svc_host: String,
    pub svc_port: u16,
    pub fs_host: String,
    pub fs_port: u16,
    pub data_dir: PathBuf,
    pub is_enabled: bool,
    pub is_read_only: bool,
}

impl WorkerInfo {
    /// Address of the worker's replication service.
    pub fn svc_addr(&self) -> String {
        format!("{}:{}", self.svc_host, self.svc_port)
    }
}

/// One database family: databases sharing a chunk partitioning scheme.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FamilyInfo {
    pub name: String,
    /// Desired number of replicas per chunk.
    pub replication_level: usize,
    pub databases: Vec<String>,
}

fn default_retry_timeout_ms() -> u64 {
    1_000
}

fn default_worker_pool_size() -> usize {
    2
}

fn default_fetch_timeout_ms() -> u64 {
    1_000
}

/// The serialized shape of the configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigData {
    pub workers: BTreeMap<String, WorkerInfo>,
    pub families: BTreeMap<String, FamilyInfo>,
    /// Delay before a failed worker connection is retried, and the poll
    /// interval for tracked requests.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
    /// Default request expiration; 0 disables the timer.
    #[serde(default)]
    pub request_timeout_ms: u64,
    /// Default job expiration; 0 disables the timer.
    #[serde(default)]
    pub job_timeout_ms: u64,
    /// Job heartbeat period; 0 disables heartbeats.
    #[serde(default)]
    pub job_heartbeat_ms: u64,
    /// Number of request-processing tasks per worker.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// How long a worker processing task waits for new input before
    /// re-checking for shutdown.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            workers: BTreeMap::new(),
            families: BTreeMap::new(),
            retry_timeout_ms: default_retry_timeout_ms(),
            request_timeout_ms: 0,
            job_timeout_ms: 0,
            job_heartbeat_ms: 0,
            worker_pool_size: default_worker_pool_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

/// Shared, mutable configuration handle.
pub struct Config {
    path: Option<PathBuf>,
    data: RwLock<ConfigData>,
}

impl Config {
    /// Build a purely in-memory configuration.
    pub fn in_memory(data: ConfigData) -> Arc<Self> {
        Arc::new(Self {
            path: None,
            data: RwLock::new(data),
        })
    }

    /// Load a JSON configuration file; mutations are written back to it.
    pub fn load(path: &Path) -> anyhow::Result<Arc<Self>> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let data: ConfigData = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Arc::new(Self {
            path: Some(path.to_path_buf()),
            data: RwLock::new(data),
        }))
    }

    /// Names of enabled workers.
    pub fn workers(&self) -> Vec<String> {
        self.data
            .read()
            .unwrap()
            .workers
            .values()
            .filter(|w| w.is_enabled)
            .map(|w| w.name.clone())
            .collect()
    }

    /// Names of all known workers, enabled or not.
    pub fn all_workers(&self) -> Vec<String> {
        self.data.read().unwrap().workers.keys().cloned().collect()
    }

    pub fn is_known_worker(&self, name: &str) -> bool {
        self.data.read().unwrap().workers.contains_key(name)
    }

    /// Look up one worker.
    pub fn worker(&self, name: &str) -> anyhow::Result<WorkerInfo> {
        match self.data.read().unwrap().workers.get(name) {
            Some(info) => Ok(info.clone()),
            None => bail!("unknown worker: {name}"),
        }
    }

    pub fn database_families(&self) -> Vec<String> {
        self.data.read().unwrap().families.keys().cloned().collect()
    }

    pub fn is_known_family(&self, name: &str) -> bool {
        self.data.read().unwrap().families.contains_key(name)
    }

    /// Databases belonging to a family.
    pub fn databases(&self, family: &str) -> anyhow::Result<Vec<String>> {
        match self.data.read().unwrap().families.get(family) {
            Some(info) => Ok(info.databases.clone()),
            None => bail!("unknown database family: {family}"),
        }
    }

    pub fn is_known_database(&self, database: &str) -> bool {
        self.data
            .read()
            .unwrap()
            .families
            .values()
            .any(|f| f.databases.iter().any(|d| d == database))
    }

    /// Family a database belongs to.
    pub fn family_of(&self, database: &str) -> anyhow::Result<String> {
        let data = self.data.read().unwrap();
        for family in data.families.values() {
            if family.databases.iter().any(|d| d == database) {
                return Ok(family.name.clone());
            }
        }
        bail!("unknown database: {database}")
    }

    pub fn replication_level(&self, family: &str) -> anyhow::Result<usize> {
        match self.data.read().unwrap().families.get(family) {
            Some(info) => Ok(info.replication_level),
            None => bail!("unknown database family: {family}"),
        }
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.data.read().unwrap().retry_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.data.read().unwrap().request_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.data.read().unwrap().job_timeout_ms)
    }

    pub fn job_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.data.read().unwrap().job_heartbeat_ms)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.data.read().unwrap().worker_pool_size
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.data.read().unwrap().fetch_timeout_ms)
    }

    /// Exclude a worker from new operations without forgetting it.
    pub fn disable_worker(&self, name: &str) -> anyhow::Result<()> {
        self.mutate(|data| {
            match data.workers.get_mut(name) {
                Some(info) => {
                    info.is_enabled = false;
                    Ok(())
                }
                None => bail!("unknown worker: {name}"),
            }
        })
    }

    /// Remove a worker permanently.
    pub fn delete_worker(&self, name: &str) -> anyhow::Result<()> {
        self.mutate(|data| {
            if data.workers.remove(name).is_none() {
                bail!("unknown worker: {name}");
            }
            Ok(())
        })
    }

    pub fn set_worker_svc_port(&self, name: &str, port: u16) -> anyhow::Result<()> {
        self.mutate(|data| {
            match data.workers.get_mut(name) {
                Some(info) => {
                    info.svc_port = port;
                    Ok(())
                }
                None => bail!("unknown worker: {name}"),
            }
        })
    }

    pub fn set_worker_fs_port(&self, name: &str, port: u16) -> anyhow::Result<()> {
        self.mutate(|data| {
            match data.workers.get_mut(name) {
                Some(info) => {
                    info.fs_port = port;
                    Ok(())
                }
                None => bail!("unknown worker: {name}"),
            }
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut ConfigData) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut data = self.data.write().unwrap();
        f(&mut data)?;
        if let Some(path) = &self.path {
            let raw = serde_json::to_vec_pretty(&*data).context("serializing config")?;
            std::fs::write(path, raw)
                .with_context(|| format!("writing config file {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> WorkerInfo {
        WorkerInfo {
            name: name.into(),
            svc_host: "127.0.0.1".into(),
            svc_port: 25000,
            fs_host: "127.0.0.1".into(),
            fs_port: 25001,
            data_dir: PathBuf::from("/tmp/data"),
            is_enabled: true,
            is_read_only: false,
        }
    }

    fn sample() -> ConfigData {
        let mut data = ConfigData::default();
        for name in ["w1", "w2"] {
            data.workers.insert(name.into(), worker(name));
        }
        data.families.insert(
            "production".into(),
            FamilyInfo {
                name: "production".into(),
                replication_level: 2,
                databases: vec!["sky_dr1".into(), "sky_dr2".into()],
            },
        );
        data
    }

    #[test]
    fn disabled_workers_are_hidden_but_still_known() {
        let config = Config::in_memory(sample());
        config.disable_worker("w2").unwrap();
        assert_eq!(config.workers(), vec!["w1".to_string()]);
        assert!(config.is_known_worker("w2"));
        assert!(!config.worker("w2").unwrap().is_enabled);
    }

    #[test]
    fn delete_worker_forgets_it() {
        let config = Config::in_memory(sample());
        config.delete_worker("w2").unwrap();
        assert!(!config.is_known_worker("w2"));
        assert!(config.worker("w2").is_err());
        assert!(config.delete_worker("w2").is_err());
    }

    #[test]
    fn family_lookups() {
        let config = Config::in_memory(sample());
        assert!(config.is_known_database("sky_dr2"));
        assert_eq!(config.family_of("sky_dr1").unwrap(), "production");
        assert_eq!(config.replication_level("production").unwrap(), 2);
        assert!(config.databases("nope").is_err());
    }

    #[test]
    fn file_backed_config_persists_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&sample()).unwrap()).unwrap();

        let config = Config::load(&path).unwrap();
        config.set_worker_svc_port("w1", 26123).unwrap();
        config.disable_worker("w2").unwrap();
        drop(config);

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.worker("w1").unwrap().svc_port, 26123);
        assert_eq!(reloaded.workers(), vec!["w1".to_string()]);
    }
}
