//! Streaming verification of replicas, oldest first.
//!
//! The job keeps a bounded window of `Find` requests in flight. Every
//! completed observation is compared against the registry's last record of
//! the same replica (the self diff) and against the records of the same
//! chunk on other workers (the other diffs); mismatches are reported
//! through a caller-supplied callback. Each completion launches a
//! replacement request for the next oldest replica, so the job runs until
//! cancelled or until the registry has nothing left to verify.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::controller::Controller;
use crate::job::{JobCore, JobExtendedState, JobOptions, JobState};
use crate::replica::{ReplicaDiff, ReplicaInfo};
use crate::request::{Request, RequestExtendedState, RequestKind, RequestOptions};

/// Invoked for every completed observation, with the self diff and the
/// diffs against other workers' replicas of the same chunk.
pub type VerifyCallback =
    Arc<dyn Fn(&Arc<VerifyJob>, &ReplicaDiff, &[ReplicaDiff]) + Send + Sync>;

struct Pending {
    /// None between the slot reservation and the launch returning.
    request: Option<Arc<Request>>,
    /// The registry record being re-verified.
    expected: ReplicaInfo,
}

struct Agg {
    /// (worker, database, chunk) -> the verification in flight
    in_flight: HashMap<(String, String, u32), Pending>,
}

/// Continuous replica verification.
pub struct VerifyJob {
    core: JobCore,
    /// Verification window size.
    max_replicas: usize,
    compute_cs: bool,
    on_diff: Option<VerifyCallback>,
    on_finish: Mutex<Option<Box<dyn FnOnce(Arc<VerifyJob>) + Send + 'static>>>,
    agg: Mutex<Agg>,
}

impl VerifyJob {
    pub fn default_options() -> JobOptions {
        JobOptions {
            priority: -1,
            exclusive: false,
            preemptive: false,
        }
    }

    pub fn create(
        controller: Arc<Controller>,
        max_replicas: usize,
        compute_cs: bool,
        parent_id: Option<String>,
        options: JobOptions,
        on_diff: Option<VerifyCallback>,
        on_finish: Option<Box<dyn FnOnce(Arc<VerifyJob>) + Send + 'static>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JobCore::new(controller, "VERIFY", parent_id, options),
            max_replicas: max_replicas.max(1),
            compute_cs,
            on_diff,
            on_finish: Mutex::new(on_finish),
            agg: Mutex::new(Agg {
                in_flight: HashMap::new(),
            }),
        })
    }

    pub fn core(&self) -> &JobCore {
        &self.core
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.core.begin()?;
        let this = self.clone();
        self.core.arm_timers(move || this.finish(JobExtendedState::TimeoutExpired));
        let launched = self.fill_window();
        if launched == 0 {
            self.finish(JobExtendedState::Success);
        }
        Ok(())
    }

    pub fn cancel(self: &Arc<Self>) {
        self.finish(JobExtendedState::Cancelled);
    }

    pub async fn await_finished(&self) {
        self.core.await_finished().await;
    }

    /// Top the in-flight window back up to `max_replicas`, skipping
    /// replicas already being verified. Returns the number launched.
    fn fill_window(self: &Arc<Self>) -> usize {
        let controller = self.core.controller().clone();
        let registry = controller.registry().clone();
        let mut launched = 0usize;
        loop {
            if self.core.state() == JobState::Finished {
                return launched;
            }
            // reserve the slot before launching; an instant completion must
            // already find its entry in the window
            let replica = {
                let mut agg = self.agg.lock().unwrap();
                if agg.in_flight.len() >= self.max_replicas {
                    return launched;
                }
                let window = self.max_replicas + agg.in_flight.len();
                let candidate = registry.find_oldest_replicas(window).into_iter().find(|r| {
                    !agg.in_flight.keys().any(|(worker, database, chunk)| {
                        *worker == r.worker && *database == r.database && *chunk == r.chunk
                    })
                });
                let Some(replica) = candidate else {
                    return launched;
                };
                agg.in_flight.insert(
                    (replica.worker.clone(), replica.database.clone(), replica.chunk),
                    Pending {
                        request: None,
                        expected: replica.clone(),
                    },
                );
                replica
            };
            let key = (replica.worker.clone(), replica.database.clone(), replica.chunk);
            let this = self.clone();
            let outcome = controller.find_replica(
                &replica.worker,
                &replica.database,
                replica.chunk,
                self.compute_cs,
                RequestOptions {
                    priority: self.core.options().priority,
                    keep_tracking: true,
                    ..Default::default()
                },
                Some(self.core.id()),
                Some(Box::new(move |request| this.on_request_finish(request))),
            );
            match outcome {
                Ok(request) => {
                    let mut agg = self.agg.lock().unwrap();
                    // an instant completion may have removed the entry already
                    if let Some(pending) = agg.in_flight.get_mut(&key) {
                        pending.request = Some(request);
                    }
                    launched += 1;
                }
                Err(err) => {
                    warn!(job = %self.core.id(), worker = %replica.worker, %err,
                          "verification request failed to launch");
                    self.agg.lock().unwrap().in_flight.remove(&key);
                    return launched;
                }
            }
        }
    }

    fn on_request_finish(self: &Arc<Self>, request: Arc<Request>) {
        if self.core.state() == JobState::Finished {
            return;
        }
        let RequestKind::Find { database, chunk, .. } = request.kind() else {
            return;
        };
        let key = (request.worker().to_string(), database.clone(), *chunk);
        let pending = {
            let mut agg = self.agg.lock().unwrap();
            if self.core.state() == JobState::Finished {
                return;
            }
            agg.in_flight.remove(&key)
        };
        if let Some(pending) = pending {
            if request.extended_state() == RequestExtendedState::Success {
                self.report_diffs(&request, &pending.expected);
            } else {
                debug!(job = %self.core.id(), id = %request.id(),
                       extended = request.extended_state().label(),
                       "verification request did not succeed");
            }
        }
        // keep the window full; stop once the registry runs dry
        let idle = {
            self.fill_window();
            self.agg.lock().unwrap().in_flight.is_empty()
        };
        if idle {
            self.finish(JobExtendedState::Success);
        }
    }

    fn report_diffs(self: &Arc<Self>, request: &Arc<Request>, expected: &ReplicaInfo) {
        let Some(on_diff) = &self.on_diff else { return };
        let Some(observed) = request.replica_info() else {
            return;
        };
        let self_diff = match ReplicaDiff::new(observed.clone(), expected.clone()) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(job = %self.core.id(), %err, "incomparable observation");
                return;
            }
        };
        let registry = self.core.controller().registry();
        let mut other_diffs = Vec::new();
        for other in registry.find_replicas(observed.chunk, &observed.database) {
            if other.worker == observed.worker {
                continue;
            }
            match ReplicaDiff::new(observed.clone(), other) {
                Ok(diff) => other_diffs.push(diff),
                Err(err) => {
                    warn!(job = %self.core.id(), %err, "incomparable observation");
                }
            }
        }
        if self_diff.not_equal() || other_diffs.iter().any(|d| d.not_equal()) {
            debug!(job = %self.core.id(), worker = %observed.worker,
                   database = %observed.database, chunk = observed.chunk,
                   flags = %self_diff.flags(), "replica mismatch");
        }
        on_diff(self, &self_diff, &other_diffs);
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
        let requests: Vec<Arc<Request>> = self
            .agg
            .lock()
            .unwrap()
            .in_flight
            .values()
            .filter_map(|pending| pending.request.clone())
            .collect();
        self.core.cancel_requests(&requests);
    }

    fn notify(self: &Arc<Self>) {
        if let Some(callback) = self.on_finish.lock().unwrap().take() {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
    }
}
