//! Creation of one chunk replica on a chosen worker.
//!
//! The chunk is replicated for every database of the family in which the
//! source worker holds a complete replica. On success the query layer is
//! told about the new replica (fire and forget; the next synchronization
//! pass repairs a lost notification).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::ensure;
use tracing::warn;

use crate::controller::Controller;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::query_mgt::QueryMgtKind;
use crate::replica::{ReplicaInfo, ReplicaStatus};
use crate::request::{Request, RequestExtendedState, RequestOptions};

/// Aggregated outcome: the created replicas, also indexed by
/// chunk/database/worker.
#[derive(Clone, Debug, Default)]
pub struct CreateReplicaResult {
    pub replicas: Vec<ReplicaInfo>,
    pub chunks: BTreeMap<u32, BTreeMap<String, BTreeMap<String, ReplicaInfo>>>,
}

pub type CreateReplicaCallback = Box<dyn FnOnce(Arc<CreateReplicaJob>) + Send + 'static>;

#[derive(Default)]
struct Agg {
    requests: Vec<Arc<Request>>,
    /// True while the fan-out loop is still submitting requests.
    launching: bool,
    num_launched: usize,
    num_finished: usize,
    num_success: usize,
    result: CreateReplicaResult,
}

impl Agg {
    fn all_finished(&self) -> bool {
        !self.launching && self.num_finished == self.num_launched
    }
}

/// Creation of one chunk replica.
pub struct CreateReplicaJob {
    core: JobCore,
    family: String,
    chunk: u32,
    source_worker: String,
    destination_worker: String,
    on_finish: Mutex<Option<CreateReplicaCallback>>,
    agg: Mutex<Agg>,
}

impl CreateReplicaJob {
    pub fn default_options() -> JobOptions {
        JobOptions {
            priority: -2,
            exclusive: false,
            preemptive: false,
        }
    }

    pub fn create(
        controller: Arc<Controller>,
        family: &str,
        chunk: u32,
        source_worker: &str,
        destination_worker: &str,
        parent_id: Option<String>,
        options: JobOptions,
        on_finish: Option<CreateReplicaCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new(controller, "CREATE_REPLICA", parent_id, options),
            family: family.to_string(),
            chunk,
            source_worker: source_worker.to_string(),
            destination_worker: destination_worker.to_string(),
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg::default()),
        })
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn destination_worker(&self) -> &str {
        &self.destination_worker
    }

    /// The aggregated result; valid once the job is finished.
    pub fn result(&self) -> anyhow::Result<CreateReplicaResult> {
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

        // refuse nonsensical input up front
        let databases = match config.databases(&self.family) {
            Ok(databases) => databases,
            Err(_) => {
                self.finish(JobExtendedState::ConfigError);
                return;
            }
        };
        let workers = config.workers();
        if !workers.contains(&self.source_worker)
            || !workers.contains(&self.destination_worker)
            || self.source_worker == self.destination_worker
        {
            self.finish(JobExtendedState::ConfigError);
            return;
        }

        let registry = controller.registry();
        if !registry
            .find_worker_replicas(self.chunk, &self.destination_worker, &databases)
            .is_empty()
        {
            warn!(job = %self.core.id(), chunk = self.chunk,
                  destination = %self.destination_worker,
                  "destination already holds replicas of the chunk");
            self.finish(JobExtendedState::Failed);
            return;
        }
        let sources: Vec<ReplicaInfo> = registry
            .find_worker_replicas(self.chunk, &self.source_worker, &databases)
            .into_iter()
            .filter(|r| r.status == ReplicaStatus::Complete)
            .collect();
        if sources.is_empty() {
            warn!(job = %self.core.id(), chunk = self.chunk, source = %self.source_worker,
                  "source holds no complete replica of the chunk");
            self.finish(JobExtendedState::Failed);
            return;
        }

        self.agg.lock().unwrap().launching = true;
        for replica in &sources {
            let this = self.clone();
            let outcome = controller.replicate(
                &self.destination_worker,
                &self.source_worker,
                &replica.database,
                self.chunk,
                RequestOptions {
                    priority: self.core.options().priority,
                    keep_tracking: true,
                    allow_duplicate: true,
                    ..Default::default()
                },
                Some(self.core.id()),
                Some(Box::new(move |request| this.on_request_finish(request))),
            );
            let mut agg = self.agg.lock().unwrap();
            match outcome {
                Ok(request) => {
                    agg.requests.push(request);
                    agg.num_launched += 1;
                }
                Err(err) => {
                    warn!(job = %self.core.id(), database = %replica.database, %err,
                          "replication request failed to launch");
                }
            }
        }
        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            agg.launching = false;
            if agg.num_launched == 0 {
                Some(false)
            } else if agg.all_finished() {
                Some(agg.num_success == agg.num_launched)
            } else {
                None
            }
        };
        self.conclude(outcome);
    }

    fn on_request_finish(self: &Arc<Self>, request: Arc<Request>) {
        if self.core.state() == JobState::Finished {
            return;
        }
        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            if self.core.state() == JobState::Finished {
                return;
            }
            agg.num_finished += 1;
            if request.extended_state() == RequestExtendedState::Success {
                agg.num_success += 1;
                if let Some(info) = request.replica_info() {
                    agg.result
                        .chunks
                        .entry(info.chunk)
                        .or_default()
                        .entry(info.database.clone())
                        .or_default()
                        .insert(info.worker.clone(), info.clone());
                    agg.result.replicas.push(info);
                }
            }
            if agg.all_finished() {
                Some(agg.num_success == agg.num_launched)
            } else {
                None
            }
        };
        self.conclude(outcome);
    }

    fn conclude(self: &Arc<Self>, outcome: Option<bool>) {
        match outcome {
            Some(true) => {
                // tell the query layer about the new replica; the periodic
                // synchronization repairs a lost notification
                let controller = self.core.controller();
                if let Ok(databases) = controller.config().databases(&self.family) {
                    controller.query_mgt().submit(
                        &self.destination_worker,
                        QueryMgtKind::AddReplica {
                            chunk: self.chunk,
                            databases,
                        },
                        None,
                    );
                }
                self.finish(JobExtendedState::Success);
            }
            Some(false) => self.finish(JobExtendedState::Failed),
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
        let requests: Vec<Arc<Request>> = self.agg.lock().unwrap().requests.clone();
        self.core.cancel_requests(&requests);
    }

    fn notify(self: &Arc<Self>) {
        if let Some(callback) = self.on_finish.lock().unwrap().take() {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
    }
}
