//! Staged decommission of a worker.
//!
//! Phases, in order:
//!
//! 1. If the doomed worker is reachable, drain its request queues and pull
//!    a final replica inventory from it (best effort; outcomes of the
//!    inventory requests are ignored).
//! 2. Disable the worker in the configuration so no new operation targets
//!    it.
//! 3. Re-discover every family and bring replication levels back up
//!    without the worker.
//! 4. Report chunks whose only replica lived on the worker (orphans).
//! 5. Optionally delete the worker from the configuration for good.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::ensure;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::find_all_job::FindAllJob;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::replica::ReplicaInfo;
use crate::replicate_job::ReplicateJob;
use crate::request::{Request, RequestExtendedState, RequestOptions};

/// Fallback expiration for the service probe when no request timeout is
/// configured; an unreachable worker must not stall the decommission.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregated outcome of the decommission.
#[derive(Clone, Debug, Default)]
pub struct DeleteWorkerResult {
    /// family -> chunk -> database -> worker -> replica created during
    /// re-replication
    pub chunks: BTreeMap<String, BTreeMap<u32, BTreeMap<String, BTreeMap<String, ReplicaInfo>>>>,
    /// chunk -> database -> last known replica, for chunks lost with the
    /// worker
    pub orphan_chunks: BTreeMap<u32, BTreeMap<String, ReplicaInfo>>,
}

pub type DeleteWorkerCallback = Box<dyn FnOnce(Arc<DeleteWorkerJob>) + Send + 'static>;

#[derive(Default)]
struct Agg {
    requests: Vec<Arc<Request>>,
    find_all_jobs: Vec<Arc<FindAllJob>>,
    replicate_jobs: Vec<Arc<ReplicateJob>>,
    result: DeleteWorkerResult,
}

/// Decommission of one worker.
pub struct DeleteWorkerJob {
    core: JobCore,
    worker: String,
    permanent_delete: bool,
    on_finish: Mutex<Option<DeleteWorkerCallback>>,
    agg: Mutex<Agg>,
}

impl DeleteWorkerJob {
    pub fn default_options() -> JobOptions {
        JobOptions {
            priority: 2,
            exclusive: true,
            preemptive: false,
        }
    }

    pub fn create(
        controller: Arc<Controller>,
        worker: &str,
        permanent_delete: bool,
        parent_id: Option<String>,
        options: JobOptions,
        on_finish: Option<DeleteWorkerCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new(controller, "DELETE_WORKER", parent_id, options),
            worker: worker.to_string(),
            permanent_delete,
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg::default()),
        })
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// The aggregated result; valid once the job is finished.
    pub fn result(&self) -> anyhow::Result<DeleteWorkerResult> {
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
        if !self.core.controller().config().is_known_worker(&self.worker) {
            self.finish(JobExtendedState::ConfigError);
            return Ok(());
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_phases().await });
        Ok(())
    }

    pub fn cancel(self: &Arc<Self>) {
        self.finish(JobExtendedState::Cancelled);
    }

    pub async fn await_finished(&self) {
        self.core.await_finished().await;
    }

    fn probe_options(&self) -> RequestOptions {
        let configured = self.core.controller().config().request_timeout();
        RequestOptions {
            priority: self.core.options().priority,
            expiration: Some(if configured.is_zero() {
                PROBE_TIMEOUT
            } else {
                configured
            }),
            ..Default::default()
        }
    }

    async fn run_phases(self: Arc<Self>) {
        self.capture_last_inventory().await;
        if self.core.state() == JobState::Finished {
            return;
        }

        // from here on no new operation may target the worker
        info!(job = %self.core.id(), worker = %self.worker, "disabling worker");
        if let Err(err) = self.core.controller().config().disable_worker(&self.worker) {
            warn!(job = %self.core.id(), %err, "disable failed");
            self.finish(JobExtendedState::ConfigError);
            return;
        }

        if !self.rebuild_families().await {
            return;
        }
        self.report_orphans();

        if self.permanent_delete {
            if let Err(err) = self.core.controller().config().delete_worker(&self.worker) {
                warn!(job = %self.core.id(), %err, "delete failed");
                self.finish(JobExtendedState::ConfigError);
                return;
            }
        }
        self.finish(JobExtendedState::Success);
    }

    /// Phase 1: drain the worker and pull its final replica inventory.
    /// Entirely best effort; an unreachable worker is simply skipped.
    async fn capture_last_inventory(&self) {
        let controller = self.core.controller().clone();
        let job_id = self.core.id().to_string();

        let probe = match controller.status_of_worker_service(
            &self.worker,
            self.probe_options(),
            Some(&job_id),
            None,
        ) {
            Ok(request) => request,
            Err(err) => {
                warn!(job = %job_id, %err, "service probe failed to launch");
                return;
            }
        };
        self.agg.lock().unwrap().requests.push(probe.clone());
        probe.await_finished().await;
        let running = probe.extended_state() == RequestExtendedState::Success
            && probe.service_state().is_some_and(|s| s.is_running);
        if !running {
            info!(job = %job_id, worker = %self.worker, "worker unreachable or stopped");
            return;
        }

        if let Ok(drain) = controller.drain_worker_service(
            &self.worker,
            self.probe_options(),
            Some(&job_id),
            None,
        ) {
            self.agg.lock().unwrap().requests.push(drain.clone());
            drain.await_finished().await;
        }

        let mut inventory = Vec::new();
        for family in controller.config().database_families() {
            let Ok(databases) = controller.config().databases(&family) else {
                continue;
            };
            for database in databases {
                match controller.find_all_replicas(
                    &self.worker,
                    &database,
                    self.probe_options(),
                    Some(&job_id),
                    None,
                ) {
                    Ok(request) => inventory.push(request),
                    Err(err) => {
                        warn!(job = %job_id, database = %database, %err,
                              "inventory request failed to launch");
                    }
                }
            }
        }
        self.agg.lock().unwrap().requests.extend(inventory.iter().cloned());
        for request in inventory {
            request.await_finished().await;
        }
    }

    /// Phases 2 and 3: rediscover and re-replicate every family without
    /// the worker. Returns false when the job finished along the way.
    async fn rebuild_families(self: &Arc<Self>) -> bool {
        let controller = self.core.controller().clone();
        for family in controller.config().database_families() {
            if self.core.state() == JobState::Finished {
                return false;
            }
            let job = match FindAllJob::create(
                controller.clone(),
                &family,
                Some(self.core.id().to_string()),
                FindAllJob::default_options(),
                None,
            )
            .and_then(|job| job.start().map(|()| job))
            {
                Ok(job) => job,
                Err(err) => {
                    warn!(job = %self.core.id(), family = %family, %err,
                          "discovery failed to launch");
                    self.finish(JobExtendedState::Failed);
                    return false;
                }
            };
            self.agg.lock().unwrap().find_all_jobs.push(job.clone());
            job.await_finished().await;
            if job.core().extended_state() != JobExtendedState::Success {
                self.finish(JobExtendedState::Failed);
                return false;
            }
        }

        for family in controller.config().database_families() {
            if self.core.state() == JobState::Finished {
                return false;
            }
            let job = ReplicateJob::create(
                controller.clone(),
                &family,
                0,
                Some(self.core.id().to_string()),
                JobOptions {
                    priority: self.core.options().priority,
                    ..ReplicateJob::default_options()
                },
                None,
            );
            if let Err(err) = job.start() {
                warn!(job = %self.core.id(), family = %family, %err,
                      "re-replication failed to launch");
                self.finish(JobExtendedState::Failed);
                return false;
            }
            self.agg.lock().unwrap().replicate_jobs.push(job.clone());
            job.await_finished().await;
            if job.core().extended_state() != JobExtendedState::Success {
                self.finish(JobExtendedState::Failed);
                return false;
            }
            if let Ok(result) = job.result() {
                self.agg
                    .lock()
                    .unwrap()
                    .result
                    .chunks
                    .insert(family.clone(), result.chunks);
            }
        }
        true
    }

    /// Phase 4: chunks whose only replica lived on the doomed worker.
    fn report_orphans(&self) {
        let registry = self.core.controller().registry().clone();
        let mut agg = self.agg.lock().unwrap();
        for replica in registry.worker_replicas(&self.worker) {
            let survives = registry
                .find_replicas(replica.chunk, &replica.database)
                .into_iter()
                .any(|r| r.worker != self.worker);
            if !survives {
                agg.result
                    .orphan_chunks
                    .entry(replica.chunk)
                    .or_default()
                    .insert(replica.database.clone(), replica);
            }
        }
        if !agg.result.orphan_chunks.is_empty() {
            warn!(job = %self.core.id(), worker = %self.worker,
                  num_orphans = agg.result.orphan_chunks.len(),
                  "chunks lost with the worker");
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
        let (requests, find_all_jobs, replicate_jobs) = {
            let agg = self.agg.lock().unwrap();
            (
                agg.requests.clone(),
                agg.find_all_jobs.clone(),
                agg.replicate_jobs.clone(),
            )
        };
        self.core.cancel_requests(&requests);
        for job in find_all_jobs {
            if job.core().state() != JobState::Finished {
                job.cancel();
            }
        }
        for job in replicate_jobs {
            if job.core().state() != JobState::Finished {
                job.cancel();
            }
        }
    }

    fn notify(self: &Arc<Self>) {
        if let Some(callback) = self.on_finish.lock().unwrap().take() {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
    }
}
