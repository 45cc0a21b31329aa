//! Management requests against the query layer.
//!
//! The query layer keeps its own per-worker view of which chunk replicas
//! are safe to scan. The controller pushes changes to that view through
//! the `QueryService` trait; requests here follow the same
//! created/in-progress/finished shape as worker requests, with a smaller
//! terminal vocabulary.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::controller::IdGenerator;

/// One chunk replica as the query layer sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReplica {
    pub chunk: u32,
    pub database: String,
    /// Number of queries currently using the replica.
    pub use_count: u32,
}

/// Failure modes of the query layer.
#[derive(Clone, Debug)]
pub enum QueryServiceError {
    /// The replica cannot be removed while queries use it.
    ChunkInUse { chunk: u32 },
    Failed(String),
}

impl std::fmt::Display for QueryServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryServiceError::ChunkInUse { chunk } => write!(f, "chunk {chunk} is in use"),
            QueryServiceError::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for QueryServiceError {}

/// The query layer's management interface.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Make a chunk replica visible to queries on one worker.
    async fn add_replica(
        &self,
        worker: &str,
        chunk: u32,
        databases: &[String],
    ) -> Result<(), QueryServiceError>;

    /// Hide a chunk replica from queries on one worker. Refused while the
    /// replica is in use unless `force` is set.
    async fn remove_replica(
        &self,
        worker: &str,
        chunk: u32,
        databases: &[String],
        force: bool,
    ) -> Result<(), QueryServiceError>;

    /// The worker's current replica set, restricted to the given databases.
    async fn get_replicas(
        &self,
        worker: &str,
        databases: &[String],
    ) -> Result<Vec<QueryReplica>, QueryServiceError>;

    /// Replace the worker's replica set, returning the previous set.
    async fn set_replicas(
        &self,
        worker: &str,
        replicas: Vec<QueryReplica>,
        force: bool,
    ) -> Result<Vec<QueryReplica>, QueryServiceError>;
}

/// In-process query service for tests and embedded setups.
#[derive(Default)]
pub struct LocalQueryService {
    // worker -> (chunk, database) -> replica
    replicas: RwLock<BTreeMap<String, BTreeMap<(u32, String), QueryReplica>>>,
    // (worker, chunk) pairs pinned by running queries
    in_use: Mutex<BTreeSet<(String, u32)>>,
}

impl LocalQueryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pin a chunk as used by a running query.
    pub fn mark_in_use(&self, worker: &str, chunk: u32) {
        self.in_use
            .lock()
            .unwrap()
            .insert((worker.to_string(), chunk));
    }

    fn is_in_use(&self, worker: &str, chunk: u32) -> bool {
        self.in_use
            .lock()
            .unwrap()
            .contains(&(worker.to_string(), chunk))
    }
}

#[async_trait]
impl QueryService for LocalQueryService {
    async fn add_replica(
        &self,
        worker: &str,
        chunk: u32,
        databases: &[String],
    ) -> Result<(), QueryServiceError> {
        let mut replicas = self.replicas.write().unwrap();
        let entry = replicas.entry(worker.to_string()).or_default();
        for database in databases {
            entry.insert(
                (chunk, database.clone()),
                QueryReplica {
                    chunk,
                    database: database.clone(),
                    use_count: 0,
                },
            );
        }
        Ok(())
    }

    async fn remove_replica(
        &self,
        worker: &str,
        chunk: u32,
        databases: &[String],
        force: bool,
    ) -> Result<(), QueryServiceError> {
        if !force && self.is_in_use(worker, chunk) {
            return Err(QueryServiceError::ChunkInUse { chunk });
        }
        let mut replicas = self.replicas.write().unwrap();
        if let Some(entry) = replicas.get_mut(worker) {
            for database in databases {
                entry.remove(&(chunk, database.clone()));
            }
        }
        Ok(())
    }

    async fn get_replicas(
        &self,
        worker: &str,
        databases: &[String],
    ) -> Result<Vec<QueryReplica>, QueryServiceError> {
        let replicas = self.replicas.read().unwrap();
        Ok(replicas
            .get(worker)
            .map(|entry| {
                entry
                    .values()
                    .filter(|r| databases.contains(&r.database))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_replicas(
        &self,
        worker: &str,
        new_replicas: Vec<QueryReplica>,
        force: bool,
    ) -> Result<Vec<QueryReplica>, QueryServiceError> {
        let mut replicas = self.replicas.write().unwrap();
        let entry = replicas.entry(worker.to_string()).or_default();
        let previous: Vec<QueryReplica> = entry.values().cloned().collect();
        if !force {
            let keep: BTreeSet<u32> = new_replicas.iter().map(|r| r.chunk).collect();
            for replica in &previous {
                if !keep.contains(&replica.chunk) && self.is_in_use(worker, replica.chunk) {
                    return Err(QueryServiceError::ChunkInUse {
                        chunk: replica.chunk,
                    });
                }
            }
        }
        entry.clear();
        for replica in new_replicas {
            entry.insert((replica.chunk, replica.database.clone()), replica);
        }
        Ok(previous)
    }
}

/// The operation a management request performs.
#[derive(Clone, Debug)]
pub enum QueryMgtKind {
    AddReplica {
        chunk: u32,
        databases: Vec<String>,
    },
    RemoveReplica {
        chunk: u32,
        databases: Vec<String>,
        force: bool,
    },
    GetReplicas {
        databases: Vec<String>,
    },
    SetReplicas {
        replicas: Vec<QueryReplica>,
        force: bool,
    },
}

impl QueryMgtKind {
    pub fn label(&self) -> &'static str {
        match self {
            QueryMgtKind::AddReplica { .. } => "QUERY_ADD_REPLICA",
            QueryMgtKind::RemoveReplica { .. } => "QUERY_REMOVE_REPLICA",
            QueryMgtKind::GetReplicas { .. } => "QUERY_GET_REPLICAS",
            QueryMgtKind::SetReplicas { .. } => "QUERY_SET_REPLICAS",
        }
    }
}

/// Primary state of a management request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMgtState {
    InProgress,
    Finished,
}

const STATE_IN_PROGRESS: u8 = 0;
const STATE_FINISHED: u8 = 1;

/// Terminal qualification of a management request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMgtExtendedState {
    None,
    Success,
    ServerError,
    ChunkInUse,
    Cancelled,
}

pub type QueryMgtCallback = Box<dyn FnOnce(Arc<QueryMgtRequest>) + Send + 'static>;

struct MgtInner {
    extended: QueryMgtExtendedState,
    error: Option<String>,
    /// Current set for get, previous set for set.
    replicas: Option<Vec<QueryReplica>>,
    on_finish: Option<QueryMgtCallback>,
}

/// One in-flight management request.
pub struct QueryMgtRequest {
    id: String,
    worker: String,
    kind: QueryMgtKind,
    state: AtomicU8,
    inner: Mutex<MgtInner>,
    finished: Notify,
}

impl QueryMgtRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn kind(&self) -> &QueryMgtKind {
        &self.kind
    }

    pub fn state(&self) -> QueryMgtState {
        match self.state.load(Ordering::SeqCst) {
            STATE_IN_PROGRESS => QueryMgtState::InProgress,
            _ => QueryMgtState::Finished,
        }
    }

    pub fn extended_state(&self) -> QueryMgtExtendedState {
        self.inner.lock().unwrap().extended
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().unwrap().error.clone()
    }

    /// Replica set carried by the outcome: the current set for a get, the
    /// previous set for a set.
    pub fn replicas(&self) -> Option<Vec<QueryReplica>> {
        self.inner.lock().unwrap().replicas.clone()
    }

    /// Cancel the request; the outcome of the underlying call is discarded.
    pub fn cancel(self: &Arc<Self>) {
        self.finish(QueryMgtExtendedState::Cancelled, None, None);
    }

    pub async fn await_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if self.state() == QueryMgtState::Finished {
                return;
            }
            notified.await;
        }
    }

    fn finish(
        self: &Arc<Self>,
        extended: QueryMgtExtendedState,
        error: Option<String>,
        replicas: Option<Vec<QueryReplica>>,
    ) {
        if self.state.swap(STATE_FINISHED, Ordering::SeqCst) == STATE_FINISHED {
            return;
        }
        debug!(id = %self.id, kind = self.kind.label(), worker = %self.worker,
               extended = ?extended, "query management request finished");
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            inner.extended = extended;
            inner.error = error;
            inner.replicas = replicas;
            inner.on_finish.take()
        };
        if let Some(callback) = callback {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
        self.finished.notify_waiters();
    }
}

/// Factory and dispatcher for query management requests.
pub struct QueryMgtServices {
    service: Arc<dyn QueryService>,
    idgen: Arc<IdGenerator>,
}

impl QueryMgtServices {
    pub fn new(service: Arc<dyn QueryService>, idgen: Arc<IdGenerator>) -> Arc<Self> {
        Arc::new(Self { service, idgen })
    }

    pub fn service(&self) -> &Arc<dyn QueryService> {
        &self.service
    }

    /// Launch one management request against the query layer.
    pub fn submit(
        &self,
        worker: &str,
        kind: QueryMgtKind,
        on_finish: Option<QueryMgtCallback>,
    ) -> Arc<QueryMgtRequest> {
        let request = Arc::new(QueryMgtRequest {
            id: self.idgen.next(),
            worker: worker.to_string(),
            kind: kind.clone(),
            state: AtomicU8::new(STATE_IN_PROGRESS),
            inner: Mutex::new(MgtInner {
                extended: QueryMgtExtendedState::None,
                error: None,
                replicas: None,
                on_finish,
            }),
            finished: Notify::new(),
        });
        let service = self.service.clone();
        let worker = worker.to_string();
        let this = request.clone();
        tokio::spawn(async move {
            let outcome = match kind {
                QueryMgtKind::AddReplica { chunk, databases } => service
                    .add_replica(&worker, chunk, &databases)
                    .await
                    .map(|()| None),
                QueryMgtKind::RemoveReplica {
                    chunk,
                    databases,
                    force,
                } => service
                    .remove_replica(&worker, chunk, &databases, force)
                    .await
                    .map(|()| None),
                QueryMgtKind::GetReplicas { databases } => service
                    .get_replicas(&worker, &databases)
                    .await
                    .map(Some),
                QueryMgtKind::SetReplicas { replicas, force } => service
                    .set_replicas(&worker, replicas, force)
                    .await
                    .map(Some),
            };
            match outcome {
                Ok(replicas) => this.finish(QueryMgtExtendedState::Success, None, replicas),
                Err(QueryServiceError::ChunkInUse { chunk }) => this.finish(
                    QueryMgtExtendedState::ChunkInUse,
                    Some(format!("chunk {chunk} is in use")),
                    None,
                ),
                Err(err) => this.finish(
                    QueryMgtExtendedState::ServerError,
                    Some(err.to_string()),
                    None,
                ),
            }
        });
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dbs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn add_get_remove_round_trip() {
        let service = LocalQueryService::new();
        service
            .add_replica("w1", 5, &dbs(&["sky_dr1", "sky_dr2"]))
            .await
            .unwrap();
        let got = service.get_replicas("w1", &dbs(&["sky_dr1"])).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].chunk, 5);

        service
            .remove_replica("w1", 5, &dbs(&["sky_dr1", "sky_dr2"]), false)
            .await
            .unwrap();
        assert!(service
            .get_replicas("w1", &dbs(&["sky_dr1", "sky_dr2"]))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn in_use_chunk_blocks_removal_unless_forced() {
        let service = LocalQueryService::new();
        service.add_replica("w1", 5, &dbs(&["sky_dr1"])).await.unwrap();
        service.mark_in_use("w1", 5);

        let err = service
            .remove_replica("w1", 5, &dbs(&["sky_dr1"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryServiceError::ChunkInUse { chunk: 5 }));

        service
            .remove_replica("w1", 5, &dbs(&["sky_dr1"]), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn set_replicas_returns_previous_set() {
        let service = LocalQueryService::new();
        service.add_replica("w1", 1, &dbs(&["sky_dr1"])).await.unwrap();
        let previous = service
            .set_replicas(
                "w1",
                vec![QueryReplica {
                    chunk: 2,
                    database: "sky_dr1".into(),
                    use_count: 0,
                }],
                false,
            )
            .await
            .unwrap();
        assert_eq!(previous.len(), 1);
        assert_eq!(previous[0].chunk, 1);
        let now = service.get_replicas("w1", &dbs(&["sky_dr1"])).await.unwrap();
        assert_eq!(now.len(), 1);
        assert_eq!(now[0].chunk, 2);
    }

    #[tokio::test]
    async fn submitted_request_finishes_with_chunk_in_use() {
        let service = LocalQueryService::new();
        service.add_replica("w1", 9, &dbs(&["sky_dr1"])).await.unwrap();
        service.mark_in_use("w1", 9);

        let services = QueryMgtServices::new(service, Arc::new(IdGenerator::new("qmgt")));
        let request = services.submit(
            "w1",
            QueryMgtKind::SetReplicas {
                replicas: vec![],
                force: false,
            },
            None,
        );
        request.await_finished().await;
        assert_eq!(request.extended_state(), QueryMgtExtendedState::ChunkInUse);
    }
}
