//! Controller-side request state machine.
//!
//! A request performs one operation against one worker through the
//! messenger. Primary state moves `Created -> InProgress -> Finished`
//! exactly once; the extended state qualifies the terminal outcome. With
//! tracking enabled, a non-terminal worker response re-arms a status poll
//! after the configured retry interval instead of finishing the request.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::config::Config;
use crate::epoch_millis;
use crate::messenger::Messenger;
use crate::proto::{
    ProtoStatus, ProtoStatusExt, RequestBody, RequestFrame, ResponseFrame, ResponseResult,
    ServiceState, TargetStatus,
};
use crate::registry::ReplicaRegistry;
use crate::replica::ReplicaInfo;

/// Shared collaborators injected into every request.
pub struct RequestServices {
    pub config: Arc<Config>,
    pub registry: Arc<dyn ReplicaRegistry>,
    pub messenger: Arc<Messenger>,
}

/// Primary request state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Created,
    InProgress,
    Finished,
}

const STATE_CREATED: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_FINISHED: u8 = 2;

/// Terminal qualification of a finished request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestExtendedState {
    /// Not finished yet.
    None,
    Success,
    /// Transport-level failure talking to the worker.
    ClientError,
    /// The worker refused the request.
    ServerBad,
    /// The worker failed to execute the request.
    ServerError,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    TimeoutExpired,
    Cancelled,
}

impl RequestExtendedState {
    pub fn label(self) -> &'static str {
        match self {
            RequestExtendedState::None => "NONE",
            RequestExtendedState::Success => "SUCCESS",
            RequestExtendedState::ClientError => "CLIENT_ERROR",
            RequestExtendedState::ServerBad => "SERVER_BAD",
            RequestExtendedState::ServerError => "SERVER_ERROR",
            RequestExtendedState::ServerQueued => "SERVER_QUEUED",
            RequestExtendedState::ServerInProgress => "SERVER_IN_PROGRESS",
            RequestExtendedState::ServerIsCancelling => "SERVER_IS_CANCELLING",
            RequestExtendedState::ServerCancelled => "SERVER_CANCELLED",
            RequestExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            RequestExtendedState::Cancelled => "CANCELLED",
        }
    }
}

/// Controller-side timestamps (epoch milliseconds, 0 = unset).
#[derive(Clone, Copy, Debug, Default)]
pub struct Performance {
    pub create_time: u64,
    pub start_time: u64,
    pub finish_time: u64,
}

/// The operation a request performs.
#[derive(Clone, Debug)]
pub enum RequestKind {
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
    Stop {
        target_id: String,
    },
    ServiceStatus,
    ServiceDrain,
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Replicate { .. } => "REPLICATE",
            RequestKind::Delete { .. } => "DELETE",
            RequestKind::Find { .. } => "FIND",
            RequestKind::FindAll { .. } => "FIND_ALL",
            RequestKind::Echo { .. } => "ECHO",
            RequestKind::Stop { .. } => "STOP",
            RequestKind::ServiceStatus => "SERVICE_STATUS",
            RequestKind::ServiceDrain => "SERVICE_DRAIN",
        }
    }

    fn body(&self, priority: i32) -> RequestBody {
        match self {
            RequestKind::Replicate {
                database,
                chunk,
                source_worker,
            } => RequestBody::Replicate {
                priority,
                database: database.clone(),
                chunk: *chunk,
                source_worker: source_worker.clone(),
            },
            RequestKind::Delete { database, chunk } => RequestBody::Delete {
                priority,
                database: database.clone(),
                chunk: *chunk,
            },
            RequestKind::Find {
                database,
                chunk,
                compute_cs,
            } => RequestBody::Find {
                priority,
                database: database.clone(),
                chunk: *chunk,
                compute_cs: *compute_cs,
            },
            RequestKind::FindAll { database } => RequestBody::FindAll {
                priority,
                database: database.clone(),
            },
            RequestKind::Echo { data, delay_ms } => RequestBody::Echo {
                priority,
                data: data.clone(),
                delay_ms: *delay_ms,
            },
            RequestKind::Stop { target_id } => RequestBody::Stop {
                target_id: target_id.clone(),
            },
            RequestKind::ServiceStatus => RequestBody::ServiceStatus,
            RequestKind::ServiceDrain => RequestBody::ServiceDrain,
        }
    }
}

/// Tuning knobs for one request.
#[derive(Clone, Copy, Debug)]
pub struct RequestOptions {
    pub priority: i32,
    /// Poll the worker until the request reaches a terminal status instead
    /// of finishing on the first non-terminal response.
    pub keep_tracking: bool,
    /// Follow the colliding request when the worker reports a duplicate.
    pub allow_duplicate: bool,
    /// Overrides the configured request timeout; `Duration::ZERO` disables
    /// the timer.
    pub expiration: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            keep_tracking: false,
            allow_duplicate: false,
            expiration: None,
        }
    }
}

/// Completion callback, dispatched on a separate task exactly once.
pub type RequestCallback = Box<dyn FnOnce(Arc<Request>) + Send + 'static>;

struct RequestInner {
    extended: RequestExtendedState,
    server_status_ext: ProtoStatusExt,
    duplicate_request_id: Option<String>,
    job_id: Option<String>,
    performance: Performance,
    result: Option<ResponseResult>,
    on_finish: Option<RequestCallback>,
    expiration_timer: Option<JoinHandle<()>>,
    poll_timer: Option<JoinHandle<()>>,
}

/// One controller request.
pub struct Request {
    services: Arc<RequestServices>,
    id: String,
    kind: RequestKind,
    worker: String,
    options: RequestOptions,
    state: AtomicU8,
    inner: Mutex<RequestInner>,
    finished: Notify,
}

impl Request {
    pub fn new(
        services: Arc<RequestServices>,
        id: String,
        kind: RequestKind,
        worker: String,
        options: RequestOptions,
        on_finish: Option<RequestCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            id,
            kind,
            worker,
            options,
            state: AtomicU8::new(STATE_CREATED),
            inner: Mutex::new(RequestInner {
                extended: RequestExtendedState::None,
                server_status_ext: ProtoStatusExt::None,
                duplicate_request_id: None,
                job_id: None,
                performance: Performance {
                    create_time: epoch_millis(),
                    ..Default::default()
                },
                result: None,
                on_finish,
                expiration_timer: None,
                poll_timer: None,
            }),
            finished: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn state(&self) -> RequestState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CREATED => RequestState::Created,
            STATE_IN_PROGRESS => RequestState::InProgress,
            _ => RequestState::Finished,
        }
    }

    pub fn extended_state(&self) -> RequestExtendedState {
        self.inner.lock().unwrap().extended
    }

    pub fn server_status_ext(&self) -> ProtoStatusExt {
        self.inner.lock().unwrap().server_status_ext
    }

    pub fn duplicate_request_id(&self) -> Option<String> {
        self.inner.lock().unwrap().duplicate_request_id.clone()
    }

    pub fn job_id(&self) -> Option<String> {
        self.inner.lock().unwrap().job_id.clone()
    }

    pub fn performance(&self) -> Performance {
        self.inner.lock().unwrap().performance
    }

    /// Worker payload of the final response, if the request succeeded.
    pub fn result(&self) -> Option<ResponseResult> {
        self.inner.lock().unwrap().result.clone()
    }

    /// Replica carried by the final response.
    pub fn replica_info(&self) -> Option<ReplicaInfo> {
        match self.result() {
            Some(ResponseResult::Replica(info)) => Some(info),
            _ => None,
        }
    }

    /// Replica set carried by the final response.
    pub fn replicas(&self) -> Option<Vec<ReplicaInfo>> {
        match self.result() {
            Some(ResponseResult::Replicas(list)) => Some(list),
            _ => None,
        }
    }

    /// Echoed payload carried by the final response.
    pub fn echo_data(&self) -> Option<Vec<u8>> {
        match self.result() {
            Some(ResponseResult::Echo(data)) => Some(data),
            _ => None,
        }
    }

    /// Service snapshot carried by the final response.
    pub fn service_state(&self) -> Option<ServiceState> {
        match self.result() {
            Some(ResponseResult::Service(state)) => Some(state),
            _ => None,
        }
    }

    /// For a successful `Stop`: what happened to the target request.
    pub fn target_status(&self) -> Option<TargetStatus> {
        match self.result() {
            Some(ResponseResult::Target(target)) => Some(target),
            _ => None,
        }
    }

    /// Submit the request to the worker. Valid exactly once.
    pub fn start(self: &Arc<Self>, job_id: Option<String>) -> anyhow::Result<()> {
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
            bail!("request {} already started", self.id);
        }
        debug!(id = %self.id, kind = self.kind.label(), worker = %self.worker, "starting");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.job_id = job_id;
            inner.performance.start_time = epoch_millis();
            let expiration = self
                .options
                .expiration
                .unwrap_or_else(|| self.services.config.request_timeout());
            if !expiration.is_zero() {
                let this = self.clone();
                inner.expiration_timer = Some(tokio::spawn(async move {
                    time::sleep(expiration).await;
                    this.expired();
                }));
            }
        }
        self.services
            .registry
            .save_request_state(&self.id, "IN_PROGRESS");
        self.send_wire(false);
        Ok(())
    }

    /// Put a frame on the wire: the operation itself, or a status poll of
    /// the tracked (possibly duplicate) request.
    fn send_wire(self: &Arc<Self>, poll: bool) {
        let body = if poll {
            let target_id = self
                .inner
                .lock()
                .unwrap()
                .duplicate_request_id
                .clone()
                .unwrap_or_else(|| self.id.clone());
            RequestBody::Status { target_id }
        } else {
            self.kind.body(self.options.priority)
        };
        let frame = RequestFrame {
            id: self.id.clone(),
            body,
        };
        let this = self.clone();
        let outcome = self.services.messenger.send(
            &self.worker,
            &self.id,
            &frame,
            Box::new(move |success, response| this.analyze(success, response)),
        );
        if let Err(err) = outcome {
            warn!(id = %self.id, %err, "submission failed");
            let mut inner = self.inner.lock().unwrap();
            if self.state() != RequestState::Finished {
                self.finish_locked(&mut inner, RequestExtendedState::ClientError);
            }
        }
    }

    /// Digest one worker response (or transport failure).
    fn analyze(self: &Arc<Self>, success: bool, response: Option<ResponseFrame>) {
        if self.state() == RequestState::Finished {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if self.state() == RequestState::Finished {
            return;
        }
        let Some(response) = response.filter(|_| success) else {
            self.finish_locked(&mut inner, RequestExtendedState::ClientError);
            return;
        };
        inner.server_status_ext = response.status_ext;
        match response.status {
            ProtoStatus::Success => {
                self.persist(&response.result);
                inner.result = Some(response.result);
                self.finish_locked(&mut inner, RequestExtendedState::Success);
            }
            ProtoStatus::Queued => {
                if self.options.keep_tracking {
                    self.arm_poll(&mut inner);
                } else {
                    self.finish_locked(&mut inner, RequestExtendedState::ServerQueued);
                }
            }
            ProtoStatus::InProgress => {
                if self.options.keep_tracking {
                    self.arm_poll(&mut inner);
                } else {
                    self.finish_locked(&mut inner, RequestExtendedState::ServerInProgress);
                }
            }
            ProtoStatus::IsCancelling => {
                if self.options.keep_tracking {
                    self.arm_poll(&mut inner);
                } else {
                    self.finish_locked(&mut inner, RequestExtendedState::ServerIsCancelling);
                }
            }
            ProtoStatus::Bad => {
                if response.status_ext == ProtoStatusExt::Duplicate {
                    inner.duplicate_request_id = response.duplicate_request_id.clone();
                    if self.options.allow_duplicate && self.options.keep_tracking {
                        debug!(id = %self.id,
                               duplicate = ?inner.duplicate_request_id,
                               "following colliding request");
                        self.arm_poll(&mut inner);
                        return;
                    }
                }
                self.finish_locked(&mut inner, RequestExtendedState::ServerBad);
            }
            ProtoStatus::Failed => {
                self.finish_locked(&mut inner, RequestExtendedState::ServerError);
            }
            ProtoStatus::Cancelled => {
                self.finish_locked(&mut inner, RequestExtendedState::ServerCancelled);
            }
        }
    }

    /// Write a successful response's replica payload through the registry.
    fn persist(&self, result: &ResponseResult) {
        match result {
            ResponseResult::Replica(info) => {
                if let RequestKind::Delete { database, chunk } = &self.kind {
                    self.services
                        .registry
                        .remove_replica(&self.worker, database, *chunk);
                } else {
                    self.services.registry.save_replica(info.clone());
                }
            }
            ResponseResult::Replicas(list) => {
                for info in list {
                    self.services.registry.save_replica(info.clone());
                }
            }
            _ => {}
        }
    }

    /// Schedule the next status poll.
    fn arm_poll(self: &Arc<Self>, inner: &mut MutexGuard<'_, RequestInner>) {
        let interval = self.services.config.retry_timeout();
        let this = self.clone();
        inner.poll_timer = Some(tokio::spawn(async move {
            time::sleep(interval).await;
            if this.state() == RequestState::Finished {
                return;
            }
            this.send_wire(true);
        }));
    }

    fn expired(self: &Arc<Self>) {
        if self.state() == RequestState::Finished {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if self.state() == RequestState::Finished {
            return;
        }
        self.finish_locked(&mut inner, RequestExtendedState::TimeoutExpired);
    }

    /// Cancel the request from the controller side.
    pub fn cancel(self: &Arc<Self>) {
        if self.state() == RequestState::Finished {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if self.state() == RequestState::Finished {
            return;
        }
        self.finish_locked(&mut inner, RequestExtendedState::Cancelled);
    }

    /// Terminal transition. Idempotent; callers hold the inner lock.
    fn finish_locked(
        self: &Arc<Self>,
        inner: &mut MutexGuard<'_, RequestInner>,
        extended: RequestExtendedState,
    ) {
        if self.state.swap(STATE_FINISHED, Ordering::SeqCst) == STATE_FINISHED {
            return;
        }
        debug!(id = %self.id, kind = self.kind.label(), worker = %self.worker,
               extended = extended.label(), "finished");
        inner.extended = extended;
        inner.performance.finish_time = epoch_millis();
        if let Some(timer) = inner.expiration_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.poll_timer.take() {
            timer.abort();
        }
        // an abandoned request must not linger in the messenger; the cancel
        // crosses into the connector, so it runs off this lock
        if matches!(
            extended,
            RequestExtendedState::Cancelled | RequestExtendedState::TimeoutExpired
        ) {
            let messenger = self.services.messenger.clone();
            let worker = self.worker.clone();
            let id = self.id.clone();
            tokio::spawn(async move { messenger.cancel(&worker, &id) });
        }
        self.services
            .registry
            .save_request_state(&self.id, &format!("FINISHED:{}", extended.label()));
        if let Some(callback) = inner.on_finish.take() {
            let this = self.clone();
            tokio::spawn(async move { callback(this) });
        }
        self.finished.notify_waiters();
    }

    /// Resolve once the request is finished.
    pub async fn await_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if self.state() == RequestState::Finished {
                return;
            }
            notified.await;
        }
    }
}
