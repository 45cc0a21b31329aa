//! Common machinery of controller jobs.
//!
//! Jobs compose requests (and other jobs) into higher-level operations.
//! Every job owns a `JobCore` carrying the state machine, options, timers
//! and persistence hooks; the concrete job drives fan-out and aggregation.
//! The primary state moves `Created -> InProgress -> Finished` exactly
//! once, and completion callbacks run on their own task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::controller::Controller;
use crate::epoch_millis;
use crate::request::{Request, RequestOptions, RequestState};

/// Expiration of the fire-and-forget stop frames sent while abandoning a
/// job, when no request timeout is configured.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    InProgress,
    Finished,
}

const STATE_CREATED: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_FINISHED: u8 = 2;

/// Terminal qualification of a finished job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobExtendedState {
    /// Not finished yet.
    None,
    Success,
    /// The job was refused up front over its inputs or the configuration.
    ConfigError,
    Failed,
    /// The query layer refused or failed an operation.
    QueryServiceFailed,
    /// The query layer refused to let go of a chunk in use.
    QueryChunkInUse,
    TimeoutExpired,
    Cancelled,
}

impl JobExtendedState {
    pub fn label(self) -> &'static str {
        match self {
            JobExtendedState::None => "NONE",
            JobExtendedState::Success => "SUCCESS",
            JobExtendedState::ConfigError => "CONFIG_ERROR",
            JobExtendedState::Failed => "FAILED",
            JobExtendedState::QueryServiceFailed => "QUERY_SERVICE_FAILED",
            JobExtendedState::QueryChunkInUse => "QUERY_CHUNK_IN_USE",
            JobExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            JobExtendedState::Cancelled => "CANCELLED",
        }
    }
}

/// Scheduling attributes of a job.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobOptions {
    pub priority: i32,
    /// The job must not run concurrently with other jobs touching the same
    /// chunks.
    pub exclusive: bool,
    /// The job may displace lower-priority work.
    pub preemptive: bool,
}

struct CoreInner {
    extended: JobExtendedState,
    begin_time: u64,
    end_time: u64,
    heartbeat_timer: Option<JoinHandle<()>>,
    expiration_timer: Option<JoinHandle<()>>,
}

/// State machine, timers and bookkeeping shared by every job.
pub struct JobCore {
    controller: Arc<Controller>,
    id: String,
    parent_id: Option<String>,
    kind: &'static str,
    options: JobOptions,
    state: AtomicU8,
    inner: Mutex<CoreInner>,
    finished: Notify,
}

impl JobCore {
    pub fn new(
        controller: Arc<Controller>,
        kind: &'static str,
        parent_id: Option<String>,
        options: JobOptions,
    ) -> Self {
        let id = controller.idgen().next();
        Self {
            controller,
            id,
            parent_id,
            kind,
            options,
            state: AtomicU8::new(STATE_CREATED),
            inner: Mutex::new(CoreInner {
                extended: JobExtendedState::None,
                begin_time: 0,
                end_time: 0,
                heartbeat_timer: None,
                expiration_timer: None,
            }),
            finished: Notify::new(),
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn options(&self) -> JobOptions {
        self.options
    }

    pub fn state(&self) -> JobState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CREATED => JobState::Created,
            STATE_IN_PROGRESS => JobState::InProgress,
            _ => JobState::Finished,
        }
    }

    pub fn extended_state(&self) -> JobExtendedState {
        self.inner.lock().unwrap().extended
    }

    pub fn begin_time(&self) -> u64 {
        self.inner.lock().unwrap().begin_time
    }

    pub fn end_time(&self) -> u64 {
        self.inner.lock().unwrap().end_time
    }

    /// Transition `Created -> InProgress`. Valid exactly once.
    pub fn begin(&self) -> anyhow::Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_IN_PROGRESS,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            bail!("job {} ({}) already started", self.id, self.kind);
        }
        info!(id = %self.id, kind = self.kind, parent = ?self.parent_id, "job starting");
        self.inner.lock().unwrap().begin_time = epoch_millis();
        self.controller
            .registry()
            .save_job_state(&self.id, "IN_PROGRESS");
        Ok(())
    }

    /// Arm the heartbeat and expiration timers from the configured
    /// intervals. A zero interval disables the respective timer.
    /// `on_expire` runs at most once, after the job timeout elapses.
    pub fn arm_timers(&self, on_expire: impl FnOnce() + Send + 'static) {
        let config = self.controller.config();
        let heartbeat = config.job_heartbeat_interval();
        let expiration = config.job_timeout();
        let mut inner = self.inner.lock().unwrap();
        if !heartbeat.is_zero() {
            let registry = self.controller.registry().clone();
            let id = self.id.clone();
            inner.heartbeat_timer = Some(tokio::spawn(async move {
                let mut ticker = time::interval(heartbeat);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    registry.update_job_heartbeat(&id, epoch_millis());
                }
            }));
        }
        if !expiration.is_zero() {
            inner.expiration_timer = Some(tokio::spawn(async move {
                time::sleep(expiration).await;
                on_expire();
            }));
        }
    }

    /// Terminal transition. Returns true for the one caller that wins;
    /// subsequent calls are no-ops.
    pub fn enter_finish(&self, extended: JobExtendedState) -> bool {
        if self.state.swap(STATE_FINISHED, Ordering::SeqCst) == STATE_FINISHED {
            return false;
        }
        debug!(id = %self.id, kind = self.kind, extended = extended.label(), "job finished");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.extended = extended;
            inner.end_time = epoch_millis();
            if let Some(timer) = inner.heartbeat_timer.take() {
                timer.abort();
            }
            if let Some(timer) = inner.expiration_timer.take() {
                timer.abort();
            }
        }
        self.controller
            .registry()
            .save_job_state(&self.id, &format!("FINISHED:{}", extended.label()));
        self.finished.notify_waiters();
        true
    }

    /// Abandon outstanding requests: finish each one client-side and tell
    /// its worker to drop the queued or running work. The stop frames are
    /// best effort; a worker that never hears one keeps the work until it
    /// finishes on its own.
    pub fn cancel_requests(&self, requests: &[Arc<Request>]) {
        let configured = self.controller.config().request_timeout();
        let options = RequestOptions {
            expiration: Some(if configured.is_zero() {
                STOP_TIMEOUT
            } else {
                configured
            }),
            ..Default::default()
        };
        for request in requests {
            if request.state() == RequestState::Finished {
                continue;
            }
            request.cancel();
            if let Err(err) = self.controller.stop_request(
                request.worker(),
                request.id(),
                options,
                Some(self.id()),
                None,
            ) {
                debug!(job = %self.id, id = %request.id(), %err, "stop not delivered");
            }
        }
    }

    /// Resolve once the job is finished.
    pub async fn await_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if self.state() == JobState::Finished {
                return;
            }
            notified.await;
        }
    }
}
