//! Worker-side request execution: the per-request state machine and the
//! replica storage seam it runs against.
//!
//! Requests execute incrementally: the processor pool calls `execute()`
//! until it reports completion, re-checking for cancellation between calls.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::bail;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::epoch_millis;
use crate::proto::{ProtoStatusExt, ResponseResult, WirePerformance};
use crate::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

/// Execution state of a queued worker request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRequestStatus {
    /// Queued, not yet picked up (also the state after a rollback).
    None,
    InProgress,
    IsCancelling,
    Cancelled,
    Succeeded,
    Failed,
}

impl WorkerRequestStatus {
    pub fn label(self) -> &'static str {
        match self {
            WorkerRequestStatus::None => "NONE",
            WorkerRequestStatus::InProgress => "IN_PROGRESS",
            WorkerRequestStatus::IsCancelling => "IS_CANCELLING",
            WorkerRequestStatus::Cancelled => "CANCELLED",
            WorkerRequestStatus::Succeeded => "SUCCEEDED",
            WorkerRequestStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of rolling back an interrupted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rollback {
    /// The request went back to `None` and must be requeued.
    Requeue,
    /// A cancellation was pending; the request is now `Cancelled`.
    Cancelled,
}

/// Storage error with its wire-level classification.
#[derive(Clone, Debug)]
pub struct StoreError {
    pub ext: ProtoStatusExt,
    pub message: String,
}

impl StoreError {
    pub fn new(ext: ProtoStatusExt, message: impl Into<String>) -> Self {
        Self {
            ext,
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.ext, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Replica storage as seen by the request executor.
pub trait ReplicaStore: Send + Sync {
    /// Materialize a replica of the chunk locally.
    fn replicate(
        &self,
        database: &str,
        chunk: u32,
        source_worker: &str,
    ) -> Result<ReplicaInfo, StoreError>;

    /// Remove the local replica of the chunk.
    fn delete(&self, database: &str, chunk: u32) -> Result<ReplicaInfo, StoreError>;

    /// Inspect the local replica of the chunk. A missing replica is a
    /// `NotFound` observation, not an error.
    fn find(&self, database: &str, chunk: u32, compute_cs: bool) -> Result<ReplicaInfo, StoreError>;

    /// Inspect every local replica of one database.
    fn find_all(&self, database: &str) -> Result<Vec<ReplicaInfo>, StoreError>;
}

/// Hex checksum of a byte slice.
fn checksum(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

/// File name of the primary data file of a chunk.
fn chunk_file_name(chunk: u32) -> String {
    format!("chunk_{chunk}.dat")
}

/// Parse a chunk number out of a replica file name.
fn parse_chunk_file(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("chunk_")?;
    let (number, _ext) = rest.split_once('.')?;
    number.parse().ok()
}

/// Filesystem-backed replica store. Each database is a directory under the
/// worker's data directory; each chunk replica is the set of files named
/// `chunk_<number>.<ext>` inside it.
pub struct FsStore {
    worker: String,
    data_dir: PathBuf,
}

impl FsStore {
    pub fn new(worker: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker: worker.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Deterministic payload for a synthesized chunk file. Source and
    /// destination workers produce identical bytes, so checksums agree.
    fn chunk_payload(database: &str, chunk: u32) -> Vec<u8> {
        format!("{database}/chunk_{chunk}\n").into_bytes().repeat(16)
    }

    fn chunk_files(&self, database: &str, chunk: u32) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.data_dir.join(database);
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            StoreError::new(ProtoStatusExt::FolderRead, format!("{}: {e}", dir.display()))
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                StoreError::new(ProtoStatusExt::FolderRead, format!("{}: {e}", dir.display()))
            })?;
            let name = entry.file_name();
            if parse_chunk_file(&name.to_string_lossy()) == Some(chunk) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn observe(
        &self,
        database: &str,
        chunk: u32,
        paths: &[PathBuf],
        compute_cs: bool,
    ) -> Result<ReplicaInfo, StoreError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let meta = std::fs::metadata(path).map_err(|e| {
                StoreError::new(ProtoStatusExt::FolderRead, format!("{}: {e}", path.display()))
            })?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let cs = if compute_cs {
                let bytes = std::fs::read(path).map_err(|e| {
                    StoreError::new(ProtoStatusExt::FolderRead, format!("{}: {e}", path.display()))
                })?;
                checksum(&bytes)
            } else {
                String::new()
            };
            files.push(FileInfo {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: meta.len(),
                cs,
                mtime,
            });
        }
        let status = if files.is_empty() {
            ReplicaStatus::NotFound
        } else {
            ReplicaStatus::Complete
        };
        Ok(ReplicaInfo {
            status,
            worker: self.worker.clone(),
            database: database.to_string(),
            chunk,
            verify_time: epoch_millis(),
            files,
        })
    }
}

impl ReplicaStore for FsStore {
    fn replicate(
        &self,
        database: &str,
        chunk: u32,
        source_worker: &str,
    ) -> Result<ReplicaInfo, StoreError> {
        debug!(worker = %self.worker, database, chunk, source_worker, "materializing replica");
        let dir = self.data_dir.join(database);
        std::fs::create_dir_all(&dir).map_err(|e| {
            StoreError::new(ProtoStatusExt::FileCopy, format!("{}: {e}", dir.display()))
        })?;
        let path = dir.join(chunk_file_name(chunk));
        std::fs::write(&path, Self::chunk_payload(database, chunk)).map_err(|e| {
            StoreError::new(ProtoStatusExt::FileCopy, format!("{}: {e}", path.display()))
        })?;
        let files = self.chunk_files(database, chunk)?;
        self.observe(database, chunk, &files, true)
    }

    fn delete(&self, database: &str, chunk: u32) -> Result<ReplicaInfo, StoreError> {
        let files = self.chunk_files(database, chunk)?;
        if files.is_empty() {
            return Err(StoreError::new(
                ProtoStatusExt::NoSuchFile,
                format!("no replica of {database}:{chunk}"),
            ));
        }
        for path in &files {
            std::fs::remove_file(path).map_err(|e| {
                StoreError::new(ProtoStatusExt::FileDelete, format!("{}: {e}", path.display()))
            })?;
        }
        self.observe(database, chunk, &[], false)
    }

    fn find(&self, database: &str, chunk: u32, compute_cs: bool) -> Result<ReplicaInfo, StoreError> {
        let files = self.chunk_files(database, chunk)?;
        self.observe(database, chunk, &files, compute_cs)
    }

    fn find_all(&self, database: &str) -> Result<Vec<ReplicaInfo>, StoreError> {
        let dir = self.data_dir.join(database);
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            StoreError::new(ProtoStatusExt::FolderRead, format!("{}: {e}", dir.display()))
        })?;
        let mut chunks: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_chunk_file(&e.file_name().to_string_lossy()))
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        let mut replicas = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let files = self.chunk_files(database, chunk)?;
            replicas.push(self.observe(database, chunk, &files, false)?);
        }
        Ok(replicas)
    }
}

/// In-memory store with an injected failure rate, for load and failure
/// testing without touching a filesystem.
pub struct SimStore {
    worker: String,
    success_rate: f64,
    rng: Mutex<StdRng>,
    replicas: RwLock<std::collections::BTreeMap<(String, u32), ReplicaInfo>>,
}

impl SimStore {
    pub fn new(worker: impl Into<String>, success_rate: f64, seed: u64) -> Self {
        Self {
            worker: worker.into(),
            success_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            replicas: RwLock::new(Default::default()),
        }
    }

    fn roll(&self) -> Result<(), StoreError> {
        let success = self.rng.lock().unwrap().gen_bool(self.success_rate);
        if success {
            Ok(())
        } else {
            Err(StoreError::new(ProtoStatusExt::None, "simulated failure"))
        }
    }

    fn synthesize(&self, database: &str, chunk: u32) -> ReplicaInfo {
        ReplicaInfo {
            status: ReplicaStatus::Complete,
            worker: self.worker.clone(),
            database: database.to_string(),
            chunk,
            verify_time: epoch_millis(),
            files: vec![FileInfo {
                name: chunk_file_name(chunk),
                size: 1024,
                cs: checksum(format!("{database}:{chunk}").as_bytes()),
                mtime: 0,
            }],
        }
    }
}

impl ReplicaStore for SimStore {
    fn replicate(
        &self,
        database: &str,
        chunk: u32,
        _source_worker: &str,
    ) -> Result<ReplicaInfo, StoreError> {
        self.roll()?;
        let info = self.synthesize(database, chunk);
        self.replicas
            .write()
            .unwrap()
            .insert((database.to_string(), chunk), info.clone());
        Ok(info)
    }

    fn delete(&self, database: &str, chunk: u32) -> Result<ReplicaInfo, StoreError> {
        self.roll()?;
        match self
            .replicas
            .write()
            .unwrap()
            .remove(&(database.to_string(), chunk))
        {
            Some(mut info) => {
                info.status = ReplicaStatus::NotFound;
                info.files.clear();
                Ok(info)
            }
            None => Err(StoreError::new(
                ProtoStatusExt::NoSuchFile,
                format!("no replica of {database}:{chunk}"),
            )),
        }
    }

    fn find(&self, database: &str, chunk: u32, _compute_cs: bool) -> Result<ReplicaInfo, StoreError> {
        self.roll()?;
        match self
            .replicas
            .read()
            .unwrap()
            .get(&(database.to_string(), chunk))
        {
            Some(info) => Ok(info.clone()),
            None => Ok(ReplicaInfo {
                status: ReplicaStatus::NotFound,
                worker: self.worker.clone(),
                database: database.to_string(),
                chunk,
                verify_time: epoch_millis(),
                files: vec![],
            }),
        }
    }

    fn find_all(&self, database: &str) -> Result<Vec<ReplicaInfo>, StoreError> {
        self.roll()?;
        Ok(self
            .replicas
            .read()
            .unwrap()
            .values()
            .filter(|r| r.database == database)
            .cloned()
            .collect())
    }
}

/// The operation a worker request performs.
#[derive(Clone, Debug)]
pub enum WorkerTask {
    Replicate {
        database: String,
        chunk: u32,
        source_worker: String,
    },
    Delete {
        database: String,
        chunk: u32,
    },
    Find {
        database: String,
        chunk: u32,
        compute_cs: bool,
    },
    FindAll {
        database: String,
    },
    Echo {
        data: Vec<u8>,
        delay_ms: u64,
    },
}

struct ExecState {
    status: WorkerRequestStatus,
    status_ext: ProtoStatusExt,
    performance: WirePerformance,
    result: ResponseResult,
    started_at: Option<Instant>,
}

/// One request queued on a worker.
pub struct WorkerRequest {
    id: String,
    priority: i32,
    task: WorkerTask,
    store: Arc<dyn ReplicaStore>,
    state: Mutex<ExecState>,
}

impl WorkerRequest {
    pub fn new(id: impl Into<String>, priority: i32, task: WorkerTask, store: Arc<dyn ReplicaStore>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            priority,
            task,
            store,
            state: Mutex::new(ExecState {
                status: WorkerRequestStatus::None,
                status_ext: ProtoStatusExt::None,
                performance: WirePerformance {
                    receive_time: epoch_millis(),
                    ..Default::default()
                },
                result: ResponseResult::None,
                started_at: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn task(&self) -> &WorkerTask {
        &self.task
    }

    /// The (database, chunk) this request mutates, if it mutates one.
    /// Used for duplicate admission checks.
    pub fn replica_target(&self) -> Option<(&str, u32)> {
        match &self.task {
            WorkerTask::Replicate { database, chunk, .. }
            | WorkerTask::Delete { database, chunk } => Some((database.as_str(), *chunk)),
            _ => None,
        }
    }

    pub fn status(&self) -> WorkerRequestStatus {
        self.state.lock().unwrap().status
    }

    pub fn status_ext(&self) -> ProtoStatusExt {
        self.state.lock().unwrap().status_ext
    }

    pub fn performance(&self) -> WirePerformance {
        self.state.lock().unwrap().performance
    }

    pub fn result(&self) -> ResponseResult {
        self.state.lock().unwrap().result.clone()
    }

    /// Transition `None` -> `InProgress` when a processing task picks the
    /// request up.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.status {
            WorkerRequestStatus::None => {
                state.status = WorkerRequestStatus::InProgress;
                state.performance.start_time = epoch_millis();
                state.started_at = Some(Instant::now());
                Ok(())
            }
            other => bail!("cannot start request {} in state {}", self.id, other.label()),
        }
    }

    /// Request cancellation. A queued request cancels immediately; a running
    /// request is flagged and finishes on its next `execute()` call.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        match state.status {
            WorkerRequestStatus::None => {
                state.status = WorkerRequestStatus::Cancelled;
                state.performance.finish_time = epoch_millis();
            }
            WorkerRequestStatus::InProgress => {
                state.status = WorkerRequestStatus::IsCancelling;
            }
            _ => {}
        }
    }

    /// Undo an interrupted execution (service shutdown mid-request).
    pub fn rollback(&self) -> anyhow::Result<Rollback> {
        let mut state = self.state.lock().unwrap();
        match state.status {
            WorkerRequestStatus::InProgress => {
                state.status = WorkerRequestStatus::None;
                state.performance.start_time = 0;
                state.started_at = None;
                Ok(Rollback::Requeue)
            }
            WorkerRequestStatus::IsCancelling => {
                state.status = WorkerRequestStatus::Cancelled;
                state.performance.finish_time = epoch_millis();
                Ok(Rollback::Cancelled)
            }
            other => bail!(
                "cannot roll back request {} in state {}",
                self.id,
                other.label()
            ),
        }
    }

    /// Advance execution. Returns true when the request reached a terminal
    /// state (`Succeeded`, `Failed` or `Cancelled`), false when it still
    /// has work to do.
    pub fn execute(&self) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.status {
            WorkerRequestStatus::InProgress => {}
            WorkerRequestStatus::IsCancelling => {
                state.status = WorkerRequestStatus::Cancelled;
                state.performance.finish_time = epoch_millis();
                return Ok(true);
            }
            other => bail!(
                "cannot execute request {} in state {}",
                self.id,
                other.label()
            ),
        }

        let outcome = match &self.task {
            WorkerTask::Echo { data, delay_ms } => {
                let elapsed = state
                    .started_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                if elapsed < *delay_ms {
                    return Ok(false);
                }
                Ok(ResponseResult::Echo(data.clone()))
            }
            WorkerTask::Replicate {
                database,
                chunk,
                source_worker,
            } => self
                .store
                .replicate(database, *chunk, source_worker)
                .map(ResponseResult::Replica),
            WorkerTask::Delete { database, chunk } => self
                .store
                .delete(database, *chunk)
                .map(ResponseResult::Replica),
            WorkerTask::Find {
                database,
                chunk,
                compute_cs,
            } => self
                .store
                .find(database, *chunk, *compute_cs)
                .map(ResponseResult::Replica),
            WorkerTask::FindAll { database } => self
                .store
                .find_all(database)
                .map(ResponseResult::Replicas),
        };

        state.performance.finish_time = epoch_millis();
        match outcome {
            Ok(result) => {
                state.result = result;
                // top-level status written last
                state.status = WorkerRequestStatus::Succeeded;
            }
            Err(err) => {
                debug!(id = %self.id, %err, "request failed");
                state.status_ext = err.ext;
                state.status = WorkerRequestStatus::Failed;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_store(dir: &std::path::Path) -> Arc<FsStore> {
        Arc::new(FsStore::new("w1", dir))
    }

    #[test]
    fn fs_store_replicate_then_find_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());

        let created = store.replicate("sky_dr1", 5, "w2").unwrap();
        assert_eq!(created.status, ReplicaStatus::Complete);
        assert_eq!(created.files.len(), 1);
        assert!(!created.files[0].cs.is_empty());

        let found = store.find("sky_dr1", 5, true).unwrap();
        assert_eq!(found.files[0].cs, created.files[0].cs);

        let all = store.find_all("sky_dr1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chunk, 5);

        let deleted = store.delete("sky_dr1", 5).unwrap();
        assert_eq!(deleted.status, ReplicaStatus::NotFound);
        assert!(store.delete("sky_dr1", 5).is_err());
    }

    #[test]
    fn fs_store_find_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());
        let found = store.find("sky_dr1", 9, false).unwrap();
        assert_eq!(found.status, ReplicaStatus::NotFound);
        assert!(found.files.is_empty());
        assert!(store.find_all("sky_dr1").unwrap().is_empty());
    }

    #[test]
    fn payloads_agree_across_workers() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let a = FsStore::new("w1", dir1.path())
            .replicate("sky_dr1", 3, "w2")
            .unwrap();
        let b = FsStore::new("w2", dir2.path())
            .replicate("sky_dr1", 3, "w1")
            .unwrap();
        assert_eq!(a.files[0].cs, b.files[0].cs);
    }

    #[test]
    fn request_lifecycle_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());
        let req = WorkerRequest::new(
            "r1",
            0,
            WorkerTask::Replicate {
                database: "sky_dr1".into(),
                chunk: 1,
                source_worker: "w2".into(),
            },
            store,
        );
        assert_eq!(req.status(), WorkerRequestStatus::None);
        req.start().unwrap();
        assert_eq!(req.status(), WorkerRequestStatus::InProgress);
        assert!(req.execute().unwrap());
        assert_eq!(req.status(), WorkerRequestStatus::Succeeded);
        assert!(req.performance().finish_time >= req.performance().start_time);
        // terminal requests cannot restart or re-execute
        assert!(req.start().is_err());
        assert!(req.execute().is_err());
    }

    #[test]
    fn cancel_before_start_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let req = WorkerRequest::new(
            "r1",
            0,
            WorkerTask::Find {
                database: "sky_dr1".into(),
                chunk: 1,
                compute_cs: false,
            },
            fs_store(dir.path()),
        );
        req.cancel();
        assert_eq!(req.status(), WorkerRequestStatus::Cancelled);
        assert!(req.start().is_err());
    }

    #[test]
    fn cancel_mid_flight_lands_on_next_execute() {
        let dir = tempfile::tempdir().unwrap();
        let req = WorkerRequest::new(
            "r1",
            0,
            WorkerTask::Echo {
                data: b"ping".to_vec(),
                delay_ms: 60_000,
            },
            fs_store(dir.path()),
        );
        req.start().unwrap();
        assert!(!req.execute().unwrap());
        req.cancel();
        assert_eq!(req.status(), WorkerRequestStatus::IsCancelling);
        assert!(req.execute().unwrap());
        assert_eq!(req.status(), WorkerRequestStatus::Cancelled);
    }

    #[test]
    fn rollback_requeues_or_finishes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let req = WorkerRequest::new(
            "r1",
            0,
            WorkerTask::Echo {
                data: vec![],
                delay_ms: 60_000,
            },
            fs_store(dir.path()),
        );
        req.start().unwrap();
        assert_eq!(req.rollback().unwrap(), Rollback::Requeue);
        assert_eq!(req.status(), WorkerRequestStatus::None);

        req.start().unwrap();
        req.cancel();
        assert_eq!(req.rollback().unwrap(), Rollback::Cancelled);
        assert_eq!(req.status(), WorkerRequestStatus::Cancelled);
    }

    #[test]
    fn sim_store_failure_rate_marks_requests_failed() {
        // success_rate 0 fails deterministically
        let store = Arc::new(SimStore::new("w1", 0.0, 42));
        let req = WorkerRequest::new(
            "r1",
            0,
            WorkerTask::FindAll {
                database: "sky_dr1".into(),
            },
            store,
        );
        req.start().unwrap();
        assert!(req.execute().unwrap());
        assert_eq!(req.status(), WorkerRequestStatus::Failed);
    }
}
