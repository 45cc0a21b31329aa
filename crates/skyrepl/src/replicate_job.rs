//! Replication-level repair for one database family.
//!
//! A discovery pass (`FindAllJob`) establishes which chunks have fewer
//! good replicas than the family's replication level. Each under-replicated
//! chunk is locked, then repaired by `CreateReplicaJob`s targeting the
//! least-loaded eligible workers. Chunks whose lock is held by another job
//! are skipped; if the pass otherwise succeeds the whole job restarts with
//! a fresh discovery to pick them up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::ensure;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::controller::Controller;
use crate::create_replica_job::CreateReplicaJob;
use crate::find_all_job::FindAllJob;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::replica::ReplicaInfo;

/// Aggregated outcome across all repair passes.
#[derive(Clone, Debug, Default)]
pub struct ReplicateResult {
    pub replicas: Vec<ReplicaInfo>,
    pub chunks: BTreeMap<u32, BTreeMap<String, BTreeMap<String, ReplicaInfo>>>,
    /// destination worker -> true when every repair against it succeeded
    pub workers: BTreeMap<String, bool>,
}

pub type ReplicateCallback = Box<dyn FnOnce(Arc<ReplicateJob>) + Send + 'static>;

#[derive(Default)]
struct Agg {
    find_all_job: Option<Arc<FindAllJob>>,
    jobs: Vec<Arc<CreateReplicaJob>>,
    /// chunk -> outstanding child jobs holding its lock
    chunk_jobs: BTreeMap<u32, usize>,
    /// True from the start of a pass until its planning loop has launched
    /// every repair; completions must not conclude a half-planned pass.
    launching: bool,
    num_launched: usize,
    num_finished: usize,
    num_success: usize,
    num_failed_locks: usize,
    num_iterations: usize,
    result: ReplicateResult,
}

impl Agg {
    fn completion(&self) -> Option<(bool, usize)> {
        if self.launching || self.num_finished != self.num_launched {
            return None;
        }
        Some((self.num_success == self.num_launched, self.num_failed_locks))
    }
}

/// Bring every chunk of a family up to its replication level.
pub struct ReplicateJob {
    core: JobCore,
    family: String,
    /// Desired replicas per chunk; 0 uses the family's configured level.
    num_replicas: usize,
    on_finish: Mutex<Option<ReplicateCallback>>,
    agg: Mutex<Agg>,
}

impl ReplicateJob {
    pub fn default_options() -> JobOptions {
        JobOptions {
            priority: 1,
            exclusive: true,
            preemptive: false,
        }
    }

    pub fn create(
        controller: Arc<Controller>,
        family: &str,
        num_replicas: usize,
        parent_id: Option<String>,
        options: JobOptions,
        on_finish: Option<ReplicateCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new(controller, "REPLICATE", parent_id, options),
            family: family.to_string(),
            num_replicas,
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg::default()),
        })
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Discovery passes performed, for introspection.
    pub fn num_iterations(&self) -> usize {
        self.agg.lock().unwrap().num_iterations
    }

    /// The aggregated result; valid once the job is finished.
    pub fn result(&self) -> anyhow::Result<ReplicateResult> {
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
        self.launch_discovery();
        Ok(())
    }

    pub fn cancel(self: &Arc<Self>) {
        self.finish(JobExtendedState::Cancelled);
    }

    pub async fn await_finished(&self) {
        self.core.await_finished().await;
    }

    fn launch_discovery(self: &Arc<Self>) {
        {
            let mut agg = self.agg.lock().unwrap();
            agg.num_iterations += 1;
            agg.jobs.clear();
            agg.launching = true;
            agg.num_launched = 0;
            agg.num_finished = 0;
            agg.num_success = 0;
            agg.num_failed_locks = 0;
        }
        let this = self.clone();
        let outcome = FindAllJob::create(
            self.core.controller().clone(),
            &self.family,
            Some(self.core.id().to_string()),
            JobOptions {
                priority: self.core.options().priority,
                ..FindAllJob::default_options()
            },
            Some(Box::new(move |job| this.on_discovery_finish(job))),
        )
        .and_then(|job| job.start().map(|()| job));
        match outcome {
            Ok(job) => {
                self.agg.lock().unwrap().find_all_job = Some(job);
            }
            Err(err) => {
                warn!(job = %self.core.id(), %err, "discovery failed to launch");
                self.finish(JobExtendedState::Failed);
            }
        }
    }

    fn on_discovery_finish(self: &Arc<Self>, find_all_job: Arc<FindAllJob>) {
        if self.core.state() == JobState::Finished {
            return;
        }
        if find_all_job.core().extended_state() != JobExtendedState::Success {
            self.finish(JobExtendedState::Failed);
            return;
        }
        let discovery = match find_all_job.result() {
            Ok(result) => result,
            Err(err) => {
                warn!(job = %self.core.id(), %err, "discovery result unavailable");
                self.finish(JobExtendedState::Failed);
                return;
            }
        };

        let controller = self.core.controller().clone();
        let config = controller.config();
        let replication_level = if self.num_replicas > 0 {
            self.num_replicas
        } else {
            match config.replication_level(&self.family) {
                Ok(level) => level,
                Err(_) => {
                    self.finish(JobExtendedState::ConfigError);
                    return;
                }
            }
        };
        let enabled_workers = config.workers();

        // occupancy: chunks held per worker, updated as repairs are planned
        let mut occupancy: BTreeMap<String, usize> = BTreeMap::new();
        for worker in &enabled_workers {
            occupancy.insert(worker.clone(), 0);
        }
        for dbmap in discovery.chunks.values() {
            let mut seen: Vec<&String> = Vec::new();
            for workers in dbmap.values() {
                for worker in workers.keys() {
                    if !seen.contains(&worker) {
                        seen.push(worker);
                        *occupancy.entry(worker.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        let locker = controller.locker().clone();
        let owner = self.core.id().to_string();
        let mut failed_locks = 0usize;

        for (chunk, workers) in &discovery.is_good {
            if self.core.state() == JobState::Finished {
                return;
            }
            let good_workers: Vec<&String> = workers
                .iter()
                .filter(|(worker, good)| **good && enabled_workers.contains(worker))
                .map(|(worker, _)| worker)
                .collect();
            if good_workers.is_empty() || good_workers.len() >= replication_level {
                continue;
            }
            // serialize repairs per chunk across competing jobs
            match locker.lock(
                Chunk {
                    database_family: self.family.clone(),
                    number: *chunk,
                },
                &owner,
            ) {
                Ok(true) => {}
                Ok(false) => {
                    failed_locks += 1;
                    continue;
                }
                Err(err) => {
                    warn!(job = %self.core.id(), chunk, %err, "chunk lock failed");
                    failed_locks += 1;
                    continue;
                }
            }

            let holders: Vec<String> = discovery
                .chunks
                .get(chunk)
                .map(|dbmap| {
                    dbmap
                        .values()
                        .flat_map(|workers| workers.keys().cloned())
                        .collect()
                })
                .unwrap_or_default();
            let mut candidates: Vec<String> = enabled_workers
                .iter()
                .filter(|worker| !holders.contains(worker))
                .cloned()
                .collect();
            candidates.sort_by_key(|worker| occupancy.get(worker).copied().unwrap_or(0));

            let needed = replication_level - good_workers.len();
            let source = good_workers[0].clone();
            let mut planned = 0usize;
            for destination in candidates.into_iter().take(needed) {
                let this = self.clone();
                let job = CreateReplicaJob::create(
                    controller.clone(),
                    &self.family,
                    *chunk,
                    &source,
                    &destination,
                    Some(self.core.id().to_string()),
                    JobOptions {
                        priority: self.core.options().priority,
                        ..CreateReplicaJob::default_options()
                    },
                    Some(Box::new(move |job| this.on_repair_finish(job))),
                );
                if let Err(err) = job.start() {
                    warn!(job = %self.core.id(), chunk, destination = %job.destination_worker(),
                          %err, "repair job failed to launch");
                    continue;
                }
                *occupancy.entry(destination).or_insert(0) += 1;
                planned += 1;
                let mut agg = self.agg.lock().unwrap();
                agg.jobs.push(job);
                agg.num_launched += 1;
                *agg.chunk_jobs.entry(*chunk).or_insert(0) += 1;
            }
            if planned == 0 {
                debug!(job = %self.core.id(), chunk, "no eligible destination worker");
                locker.release(&Chunk {
                    database_family: self.family.clone(),
                    number: *chunk,
                });
            }
        }

        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            agg.num_failed_locks = failed_locks;
            agg.launching = false;
            agg.completion()
        };
        self.conclude(outcome);
    }

    fn on_repair_finish(self: &Arc<Self>, job: Arc<CreateReplicaJob>) {
        let chunk = Chunk {
            database_family: self.family.clone(),
            number: job.chunk(),
        };
        if self.core.state() == JobState::Finished {
            self.core.controller().locker().release(&chunk);
            return;
        }
        let outcome = {
            let mut agg = self.agg.lock().unwrap();
            if self.core.state() == JobState::Finished {
                self.core.controller().locker().release(&chunk);
                return;
            }
            agg.num_finished += 1;
            // release the chunk once its last repair completes
            if let Some(count) = agg.chunk_jobs.get_mut(&job.chunk()) {
                *count -= 1;
                if *count == 0 {
                    agg.chunk_jobs.remove(&job.chunk());
                    self.core.controller().locker().release(&chunk);
                }
            }
            let ok = job.core().extended_state() == JobExtendedState::Success;
            if ok {
                agg.num_success += 1;
                if let Ok(result) = job.result() {
                    for info in result.replicas {
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
            }
            agg.result
                .workers
                .entry(job.destination_worker().to_string())
                .and_modify(|v| *v = *v && ok)
                .or_insert(ok);
            agg.completion()
        };
        self.conclude(outcome);
    }

    fn conclude(self: &Arc<Self>, outcome: Option<(bool, usize)>) {
        match outcome {
            Some((true, failed_locks)) if failed_locks > 0 => {
                info!(job = %self.core.id(), failed_locks,
                      "restarting pass over contended chunks");
                self.launch_discovery();
            }
            Some((true, _)) => self.finish(JobExtendedState::Success),
            Some((false, _)) => self.finish(JobExtendedState::Failed),
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
        // whatever happens, this job's locks must not outlive it
        if let Err(err) = self
            .core
            .controller()
            .locker()
            .release_owner(self.core.id())
        {
            warn!(job = %self.core.id(), %err, "lock release failed");
        }
        self.notify();
    }

    fn cancel_impl(&self) {
        let (find_all_job, jobs) = {
            let agg = self.agg.lock().unwrap();
            (agg.find_all_job.clone(), agg.jobs.clone())
        };
        if let Some(job) = find_all_job {
            if job.core().state() != JobState::Finished {
                job.cancel();
            }
        }
        for job in jobs {
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
