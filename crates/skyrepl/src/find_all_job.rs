//! Family-wide replica discovery.
//!
//! Fans one `FindAll` request out to every enabled worker for every
//! database of the family, then derives per-chunk placement facts from the
//! aggregated observations:
//!
//! - which databases a chunk participates in,
//! - which workers hold a complete replica per database,
//! - whether a worker holds the chunk for every participating database
//!   (colocation),
//! - whether a colocated holding is complete across the board (good).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context};
use tracing::warn;

use crate::controller::Controller;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::replica::{ReplicaInfo, ReplicaStatus};
use crate::request::{Request, RequestExtendedState, RequestOptions};

/// chunk -> database -> worker -> observation
pub type ChunkMap = BTreeMap<u32, BTreeMap<String, BTreeMap<String, ReplicaInfo>>>;

/// Aggregated discovery outcome.
#[derive(Clone, Debug, Default)]
pub struct FindAllResult {
    pub replicas: Vec<ReplicaInfo>,
    pub chunks: ChunkMap,
    /// worker -> true when every request against it succeeded
    pub workers: BTreeMap<String, bool>,
    /// chunk -> participating databases
    pub databases: BTreeMap<u32, Vec<String>>,
    /// chunk -> database -> workers holding a complete replica
    pub complete: BTreeMap<u32, BTreeMap<String, Vec<String>>>,
    /// chunk -> worker -> the worker holds the chunk for every database
    pub is_colocated: BTreeMap<u32, BTreeMap<String, bool>>,
    /// chunk -> worker -> colocated and complete everywhere
    pub is_good: BTreeMap<u32, BTreeMap<String, bool>>,
}

pub type FindAllCallback = Box<dyn FnOnce(Arc<FindAllJob>) + Send + 'static>;

#[derive(Default)]
struct Agg {
    requests: Vec<Arc<Request>>,
    /// True while the fan-out loop is still submitting requests; completions
    /// must not conclude the job against a partial launch count.
    launching: bool,
    num_launched: usize,
    num_finished: usize,
    num_success: usize,
    result: FindAllResult,
}

impl Agg {
    fn all_finished(&self) -> bool {
        !self.launching && self.num_finished == self.num_launched
    }
}

/// Replica discovery across one database family.
pub struct FindAllJob {
    core: JobCore,
    family: String,
    databases: Vec<String>,
    on_finish: Mutex<Option<FindAllCallback>>,
    agg: Mutex<Agg>,
}

impl FindAllJob {
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
        parent_id: Option<String>,
        options: JobOptions,
        on_finish: Option<FindAllCallback>,
    ) -> anyhow::Result<Arc<Self>> {
        let databases = controller
            .config()
            .databases(family)
            .context("resolving database family")?;
        Ok(Arc::new(Self {
            core: JobCore::new(controller, "FIND_ALL", parent_id, options),
            family: family.to_string(),
            databases,
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg::default()),
        }))
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// The aggregated result; valid once the job is finished.
    pub fn result(&self) -> anyhow::Result<FindAllResult> {
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
        let workers = controller.config().workers();
        self.agg.lock().unwrap().launching = true;
        for worker in &workers {
            for database in &self.databases {
                let this = self.clone();
                let outcome = controller.find_all_replicas(
                    worker,
                    database,
                    RequestOptions {
                        priority: self.core.options().priority,
                        keep_tracking: true,
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
                        warn!(job = %self.core.id(), worker = %worker, database = %database,
                              %err, "discovery request failed to launch");
                        agg.result.workers.insert(worker.clone(), false);
                    }
                }
            }
        }
        let done = {
            let mut agg = self.agg.lock().unwrap();
            agg.launching = false;
            agg.all_finished()
        };
        if done {
            self.derive_and_finish();
        }
    }

    fn on_request_finish(self: &Arc<Self>, request: Arc<Request>) {
        if self.core.state() == JobState::Finished {
            return;
        }
        let done = {
            let mut agg = self.agg.lock().unwrap();
            if self.core.state() == JobState::Finished {
                return;
            }
            agg.num_finished += 1;
            let worker = request.worker().to_string();
            let ok = request.extended_state() == RequestExtendedState::Success;
            if ok {
                agg.num_success += 1;
                if let Some(replicas) = request.replicas() {
                    for info in replicas {
                        agg.result
                            .chunks
                            .entry(info.chunk)
                            .or_default()
                            .entry(info.database.clone())
                            .or_default()
                            .insert(worker.clone(), info.clone());
                        agg.result.replicas.push(info);
                    }
                }
            }
            agg.result
                .workers
                .entry(worker)
                .and_modify(|v| *v = *v && ok)
                .or_insert(ok);
            agg.all_finished()
        };
        if done {
            self.derive_and_finish();
        }
    }

    /// Compute the placement facts and finish.
    fn derive_and_finish(self: &Arc<Self>) {
        let extended = {
            let mut agg = self.agg.lock().unwrap();
            let chunks = agg.result.chunks.clone();
            for (chunk, dbmap) in &chunks {
                let databases: Vec<String> = dbmap.keys().cloned().collect();
                let mut worker_hits: BTreeMap<String, usize> = BTreeMap::new();
                for (database, workers) in dbmap {
                    for (worker, replica) in workers {
                        *worker_hits.entry(worker.clone()).or_insert(0) += 1;
                        if replica.status == ReplicaStatus::Complete {
                            agg.result
                                .complete
                                .entry(*chunk)
                                .or_default()
                                .entry(database.clone())
                                .or_default()
                                .push(worker.clone());
                        }
                    }
                }
                for (worker, hits) in worker_hits {
                    let colocated = hits == databases.len();
                    let good = colocated
                        && dbmap.values().all(|workers| {
                            workers
                                .get(&worker)
                                .is_some_and(|r| r.status == ReplicaStatus::Complete)
                        });
                    agg.result
                        .is_colocated
                        .entry(*chunk)
                        .or_default()
                        .insert(worker.clone(), colocated);
                    agg.result
                        .is_good
                        .entry(*chunk)
                        .or_default()
                        .insert(worker, good);
                }
                agg.result.databases.insert(*chunk, databases);
            }
            if agg.num_success == agg.num_launched {
                JobExtendedState::Success
            } else {
                JobExtendedState::Failed
            }
        };
        self.finish(extended);
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
