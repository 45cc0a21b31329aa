//! Persistent view of replicas and request/job states.
//!
//! The registry is an external collaborator consumed through a trait; the
//! in-memory implementation here backs tests and embedded deployments. The
//! controller writes every replica observation and every request/job state
//! transition through it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::replica::ReplicaInfo;

/// Storage seam for replica observations and execution bookkeeping.
pub trait ReplicaRegistry: Send + Sync {
    /// Record (or refresh) one replica observation.
    fn save_replica(&self, info: ReplicaInfo);

    /// Forget one replica.
    fn remove_replica(&self, worker: &str, database: &str, chunk: u32);

    /// Replicas of `chunk` on `worker` across the given databases.
    fn find_worker_replicas(&self, chunk: u32, worker: &str, databases: &[String])
        -> Vec<ReplicaInfo>;

    /// Replicas of `chunk` in one database across all workers.
    fn find_replicas(&self, chunk: u32, database: &str) -> Vec<ReplicaInfo>;

    /// Every replica on one worker.
    fn worker_replicas(&self, worker: &str) -> Vec<ReplicaInfo>;

    /// Up to `max` replicas with the oldest verification times.
    fn find_oldest_replicas(&self, max: usize) -> Vec<ReplicaInfo>;

    /// Record the terminal (or latest) state of a controller request.
    fn save_request_state(&self, id: &str, state: &str);

    /// Record the terminal (or latest) state of a job.
    fn save_job_state(&self, id: &str, state: &str);

    /// Record a liveness heartbeat for a long-running job.
    fn update_job_heartbeat(&self, id: &str, time_ms: u64);
}

type ReplicaKey = (String, String, u32);

/// In-memory registry.
#[derive(Default)]
pub struct MemoryRegistry {
    // (worker, database, chunk) -> observation
    replicas: RwLock<BTreeMap<ReplicaKey, ReplicaInfo>>,
    request_states: RwLock<BTreeMap<String, String>>,
    job_states: RwLock<BTreeMap<String, String>>,
    job_heartbeats: RwLock<BTreeMap<String, u64>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest recorded state of a request, if any.
    pub fn request_state(&self, id: &str) -> Option<String> {
        self.request_states.read().unwrap().get(id).cloned()
    }

    /// Latest recorded state of a job, if any.
    pub fn job_state(&self, id: &str) -> Option<String> {
        self.job_states.read().unwrap().get(id).cloned()
    }

    /// Latest heartbeat of a job, if any.
    pub fn job_heartbeat(&self, id: &str) -> Option<u64> {
        self.job_heartbeats.read().unwrap().get(id).copied()
    }

    /// Total number of stored replica observations.
    pub fn num_replicas(&self) -> usize {
        self.replicas.read().unwrap().len()
    }
}

impl ReplicaRegistry for MemoryRegistry {
    fn save_replica(&self, info: ReplicaInfo) {
        let key = (info.worker.clone(), info.database.clone(), info.chunk);
        self.replicas.write().unwrap().insert(key, info);
    }

    fn remove_replica(&self, worker: &str, database: &str, chunk: u32) {
        let key = (worker.to_string(), database.to_string(), chunk);
        self.replicas.write().unwrap().remove(&key);
    }

    fn find_worker_replicas(
        &self,
        chunk: u32,
        worker: &str,
        databases: &[String],
    ) -> Vec<ReplicaInfo> {
        self.replicas
            .read()
            .unwrap()
            .values()
            .filter(|r| r.chunk == chunk && r.worker == worker && databases.contains(&r.database))
            .cloned()
            .collect()
    }

    fn find_replicas(&self, chunk: u32, database: &str) -> Vec<ReplicaInfo> {
        self.replicas
            .read()
            .unwrap()
            .values()
            .filter(|r| r.chunk == chunk && r.database == database)
            .cloned()
            .collect()
    }

    fn worker_replicas(&self, worker: &str) -> Vec<ReplicaInfo> {
        self.replicas
            .read()
            .unwrap()
            .values()
            .filter(|r| r.worker == worker)
            .cloned()
            .collect()
    }

    fn find_oldest_replicas(&self, max: usize) -> Vec<ReplicaInfo> {
        let mut all: Vec<ReplicaInfo> = self.replicas.read().unwrap().values().cloned().collect();
        all.sort_by_key(|r| r.verify_time);
        all.truncate(max);
        all
    }

    fn save_request_state(&self, id: &str, state: &str) {
        self.request_states
            .write()
            .unwrap()
            .insert(id.to_string(), state.to_string());
    }

    fn save_job_state(&self, id: &str, state: &str) {
        self.job_states
            .write()
            .unwrap()
            .insert(id.to_string(), state.to_string());
    }

    fn update_job_heartbeat(&self, id: &str, time_ms: u64) {
        self.job_heartbeats
            .write()
            .unwrap()
            .insert(id.to_string(), time_ms);
    }
}
