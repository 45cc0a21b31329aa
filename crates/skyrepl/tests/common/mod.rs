//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skyrepl::config::{Config, ConfigData, FamilyInfo, WorkerInfo};
use skyrepl::controller::Controller;
use skyrepl::query_mgt::LocalQueryService;
use skyrepl::registry::MemoryRegistry;
use skyrepl::replica::ReplicaInfo;
use skyrepl::worker_request::{FsStore, ReplicaStore};
use skyrepl::worker_server::WorkerServer;

/// Timeout for request and job round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

/// An in-process cluster: one controller plus N worker services bound to
/// free ports, all sharing one in-memory configuration.
pub struct Cluster {
    pub config: Arc<Config>,
    pub controller: Arc<Controller>,
    pub registry: Arc<MemoryRegistry>,
    pub query: Arc<LocalQueryService>,
    pub servers: Vec<Arc<WorkerServer>>,
    data_dirs: BTreeMap<String, PathBuf>,
    _tmp: Vec<tempfile::TempDir>,
}

pub fn worker_name(index: usize) -> String {
    format!("w{}", index + 1)
}

/// Build the configuration and start every worker service. Workers bind
/// port 0; the chosen ports are written back into the configuration before
/// the controller sends anything.
pub async fn spawn_cluster(
    num_workers: usize,
    databases: &[&str],
    replication_level: usize,
) -> Cluster {
    spawn_cluster_with_request_timeout(num_workers, databases, replication_level, 0).await
}

/// Like `spawn_cluster`, with a request timeout so that requests against an
/// unresponsive worker give up instead of polling forever.
pub async fn spawn_cluster_with_request_timeout(
    num_workers: usize,
    databases: &[&str],
    replication_level: usize,
    request_timeout_ms: u64,
) -> Cluster {
    let mut tmp = Vec::new();
    let mut data_dirs = BTreeMap::new();
    let mut data = ConfigData {
        retry_timeout_ms: 50,
        fetch_timeout_ms: 100,
        request_timeout_ms,
        ..ConfigData::default()
    };
    for index in 0..num_workers {
        let name = worker_name(index);
        let dir = tempfile::tempdir().expect("creating worker data dir");
        data_dirs.insert(name.clone(), dir.path().to_path_buf());
        data.workers.insert(
            name.clone(),
            WorkerInfo {
                name: name.clone(),
                svc_host: "127.0.0.1".into(),
                svc_port: 0,
                fs_host: "127.0.0.1".into(),
                fs_port: 0,
                data_dir: dir.path().to_path_buf(),
                is_enabled: true,
                is_read_only: false,
            },
        );
        tmp.push(dir);
    }
    data.families.insert(
        "production".into(),
        FamilyInfo {
            name: "production".into(),
            replication_level,
            databases: databases.iter().map(|s| s.to_string()).collect(),
        },
    );
    let config = Config::in_memory(data);

    let mut servers = Vec::new();
    for index in 0..num_workers {
        let name = worker_name(index);
        let server = WorkerServer::spawn(config.clone(), &name)
            .await
            .expect("starting worker service");
        config
            .set_worker_svc_port(&name, server.local_addr().port())
            .expect("recording worker port");
        servers.push(server);
    }

    let registry = Arc::new(MemoryRegistry::new());
    let query = LocalQueryService::new();
    let controller = Controller::new(config.clone(), registry.clone(), query.clone());
    Cluster {
        config,
        controller,
        registry,
        query,
        servers,
        data_dirs,
        _tmp: tmp,
    }
}

/// A controller whose single worker "w1" lives at a port the test serves
/// itself, for exercising the wire layer against scripted peers.
pub fn stub_controller(port: u16) -> Arc<Controller> {
    let mut data = ConfigData {
        retry_timeout_ms: 50,
        fetch_timeout_ms: 100,
        ..ConfigData::default()
    };
    data.workers.insert(
        "w1".into(),
        WorkerInfo {
            name: "w1".into(),
            svc_host: "127.0.0.1".into(),
            svc_port: port,
            fs_host: "127.0.0.1".into(),
            fs_port: 0,
            data_dir: std::env::temp_dir(),
            is_enabled: true,
            is_read_only: false,
        },
    );
    let config = Config::in_memory(data);
    let registry = Arc::new(MemoryRegistry::new());
    Controller::new(config, registry, LocalQueryService::new())
}

impl Cluster {
    /// Materialize a chunk replica directly in a worker's data directory.
    pub fn seed(&self, worker: &str, database: &str, chunk: u32) -> ReplicaInfo {
        let dir = self.data_dirs.get(worker).expect("unknown worker");
        FsStore::new(worker, dir)
            .replicate(database, chunk, "seed")
            .expect("seeding replica")
    }

    /// Path of the primary data file of a seeded chunk.
    pub fn chunk_path(&self, worker: &str, database: &str, chunk: u32) -> PathBuf {
        self.data_dirs
            .get(worker)
            .expect("unknown worker")
            .join(database)
            .join(format!("chunk_{chunk}.dat"))
    }
}

/// Poll a condition until it holds, panicking after `IO_TIMEOUT`.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
