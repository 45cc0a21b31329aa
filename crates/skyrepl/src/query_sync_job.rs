//! Synchronization of the query layer with the replica registry.
//!
//! For every enabled worker the authoritative replica set of one family is
//! computed from the registry and pushed to the query layer as a full
//! replacement. The previous and new sets are reported per worker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::ensure;
use tracing::warn;

use crate::controller::Controller;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::query_mgt::{QueryMgtExtendedState, QueryMgtKind, QueryMgtRequest, QueryReplica};
use crate::replica::ReplicaStatus;

/// Per-worker before/after replica sets.
#[derive(Clone, Debug, Default)]
pub struct QuerySyncResult {
    pub prev_replicas: BTreeMap<String, Vec<QueryReplica>>,
    pub new_replicas: BTreeMap<String, Vec<QueryReplica>>,
    /// worker -> the push succeeded
    pub workers: BTreeMap<String, bool>,
}

pub type QuerySyncCallback = Box<dyn FnOnce(Arc<QuerySyncJob>) + Send + 'static>;

#[derive(Default)]
struct Agg {
    requests: Vec<Arc<QueryMgtRequest>>,
    /// True while the fan-out loop is still submitting requests.
    launching: bool,
    num_launched: usize,
    num_finished: usize,
    num_success: usize,
    saw_chunk_in_use: bool,
    result: QuerySyncResult,
}

impl Agg {
    fn completion(&self) -> Option<(bool, bool)> {
        if self.launching || self.num_finished != self.num_launched {
            return None;
        }
        Some((self.num_success == self.num_launched, self.saw_chunk_in_use))
    }
}

/// Push authoritative replica sets to the query layer.
pub struct QuerySyncJob {
    core: JobCore,
    family: String,
    /// Replace replica sets even when chunks are reported in use.
    force: bool,
    on_finish: Mutex<Option<QuerySyncCallback>>,
    agg: Mutex<Agg>,
}

impl QuerySyncJob {
    pub fn default_options() -> JobOptions {
        JobOptions {
            priority: 0,
            exclusive: false,
            preemptive: false,
        }
    }

    pub fn create(
        controller: Arc<Controller>,
        family: &str,
        force: bool,
        parent_id: Option<String>,
        options: JobOptions,
        on_finish: Option<QuerySyncCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new(controller, "QUERY_SYNC", parent_id, options),
            family: family.to_string(),
            force,
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg::default()),
        })
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    /// The aggregated result; valid once the job is finished.
    pub fn result(&self) -> anyhow::Result<QuerySyncResult> {
        ensure!(
            self.core.state() == JobState::Finished,
            "job {} is not finished",
            self.core.id()
        );
        Ok(self.agg.lock().unwrap().result.clone())
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.core.begin()?;
        let this = self.clone();
        self.core.arm_timers(move || this.finish(JobExtendedState::TimeoutExpired));
        self.start_impl();
        Ok(())
    }

    pub fn cancel(self: &Arc<Self>) {
        self.finish(JobExtendedState::Cancelled);
    }

    pub async fn await_finished(&self) {
        self.core.await_finished().await;
    }

    fn start_impl(self: &Arc<Self>) {
        let controller = self.core.controller().clone();
        let config = controller.config();
        let databases = match config.databases(&self.family) {
            Ok(databases) => databases,
            Err(_) => {
                self.finish(JobExtendedState::ConfigError);
                return;
            }
        };
        let registry = controller.registry();
        self.agg.lock().unwrap().launching = true;
        for worker in config.workers() {
            let replicas: Vec<QueryReplica> = registry
                .worker_replicas(&worker)
                .into_iter()
                .filter(|r| r.status == ReplicaStatus::Complete && databases.contains(&r.database))
                .map(|r| QueryReplica {
                    chunk: r.chunk,
                    database: r.database,
                    use_count: 0,
                })
                .collect();
            {
                let mut agg = self.agg.lock().unwrap();
                agg.result
                    .new_replicas
                    .insert(worker.clone(), replicas.clone());
            }
            let this = self.clone();
            let request = controller.query_mgt().submit(
                &worker,
                QueryMgtKind::SetReplicas {
                    replicas,
                    force: self.force,
                },
                Some(Box::new(move |request| this.on_request_finish(request))),
            );
            let mut agg = self.agg.lock().unwrap();
            agg.requests.push(request);
            agg.num_launched += 1;
        }
        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            agg.launching = false;
            agg.completion()
        };
        self.conclude(outcome);
    }

    fn on_request_finish(self: &Arc<Self>, request: Arc<QueryMgtRequest>) {
        if self.core.state() == JobState::Finished {
            return;
        }
        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            if self.core.state() == JobState::Finished {
                return;
            }
            agg.num_finished += 1;
            let extended = request.extended_state();
            let ok = extended == QueryMgtExtendedState::Success;
            if ok {
                agg.num_success += 1;
                if let Some(previous) = request.replicas() {
                    agg.result
                        .prev_replicas
                        .insert(request.worker().to_string(), previous);
                }
            } else {
                if extended == QueryMgtExtendedState::ChunkInUse {
                    agg.saw_chunk_in_use = true;
                }
                warn!(job = %self.core.id(), worker = %request.worker(),
                      extended = ?extended, error = ?request.error(),
                      "replica push refused");
            }
            agg.result.workers.insert(request.worker().to_string(), ok);
            agg.completion()
        };
        self.conclude(outcome);
    }

    fn conclude(self: &Arc<Self>, outcome: Option<(bool, bool)>) {
        match outcome {
            Some((true, _)) => self.finish(JobExtendedState::Success),
            Some((false, true)) => self.finish(JobExtendedState::QueryChunkInUse),
            Some((false, false)) => self.finish(JobExtendedState::QueryServiceFailed),
            None => {}
        }
    }

    fn finish(self: &Arc<Self>, extended: JobExtendedState) {
        if !self.core.enter_finish(extended) {
            return;
        }
        if extended != JobExtendedState::Success {
            self.cancel_impl();
        }
        self.notify();
    }

    fn cancel_impl(&self) {
        let requests: Vec<Arc<QueryMgtRequest>> = self.agg.lock().unwrap().requests.clone();
        for request in requests {
            request.cancel();
        }
    }

    fn notify(self: &Arc<Self>) {
        if let Some(callback) = self.on_finish.lock().unwrap().take() {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
    }
}
