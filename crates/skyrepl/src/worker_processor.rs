//! Worker request processor: prioritized admission queues and the task
//! pool that executes them.
//!
//! Requests move between three queues: `new` (admitted, waiting),
//! `in_progress` (claimed by a processing task) and `finished` (terminal,
//! retained for status queries). Shutdown is cooperative: processing tasks
//! observe a stop flag between execution increments and roll interrupted
//! requests back into `new`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::epoch_millis;
use crate::proto::{
    ProtoStatus, ProtoStatusExt, RequestBody, ResponseFrame, ResponseResult, ServiceState,
    TargetStatus,
};
use crate::worker_request::{
    ReplicaStore, Rollback, WorkerRequest, WorkerRequestStatus, WorkerTask,
};

/// Upper bound on one randomized fetch poll.
const FETCH_POLL_MAX_MS: u64 = 20;
/// Pause between execution increments of one request.
const EXECUTE_INCREMENT_MS: u64 = 10;

/// Lifecycle of the processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    Running,
    Stopping,
    Stopped,
}

struct Queues {
    state: ProcessorState,
    new: Vec<Arc<WorkerRequest>>,
    in_progress: Vec<Arc<WorkerRequest>>,
    finished: Vec<Arc<WorkerRequest>>,
    stop: Arc<AtomicBool>,
}

/// The per-worker request processor.
pub struct WorkerProcessor {
    worker: String,
    config: Arc<Config>,
    store: Arc<dyn ReplicaStore>,
    queues: Mutex<Queues>,
    active_tasks: Arc<AtomicUsize>,
    start_time: u64,
}

impl WorkerProcessor {
    pub fn new(
        worker: impl Into<String>,
        config: Arc<Config>,
        store: Arc<dyn ReplicaStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker: worker.into(),
            config,
            store,
            queues: Mutex::new(Queues {
                state: ProcessorState::Stopped,
                new: Vec::new(),
                in_progress: Vec::new(),
                finished: Vec::new(),
                stop: Arc::new(AtomicBool::new(true)),
            }),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            start_time: epoch_millis(),
        })
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn state(&self) -> ProcessorState {
        self.queues.lock().unwrap().state
    }

    /// Start the processing task pool. A no-op unless the processor is
    /// stopped.
    pub fn run(self: &Arc<Self>) {
        let (stop, pool_size) = {
            let mut queues = self.queues.lock().unwrap();
            if queues.state != ProcessorState::Stopped {
                return;
            }
            queues.state = ProcessorState::Running;
            queues.stop = Arc::new(AtomicBool::new(false));
            (queues.stop.clone(), self.config.worker_pool_size())
        };
        info!(worker = %self.worker, pool_size, "processor starting");
        for _ in 0..pool_size.max(1) {
            self.active_tasks.fetch_add(1, Ordering::SeqCst);
            let this = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                this.serve(stop).await;
            });
        }
    }

    /// Request shutdown. The transition to `Stopped` completes when the
    /// last processing task confirms it.
    pub fn stop(&self) {
        let mut queues = self.queues.lock().unwrap();
        if queues.state != ProcessorState::Running {
            return;
        }
        info!(worker = %self.worker, "processor stopping");
        queues.state = ProcessorState::Stopping;
        queues.stop.store(true, Ordering::SeqCst);
    }

    async fn serve(self: Arc<Self>, stop: Arc<AtomicBool>) {
        let fetch_timeout = self.config.fetch_timeout();
        'outer: while !stop.load(Ordering::SeqCst) {
            let Some(request) = self.fetch_next_for_processing(&stop, fetch_timeout).await
            else {
                continue;
            };
            debug!(worker = %self.worker, id = %request.id(), "processing");
            loop {
                if stop.load(Ordering::SeqCst)
                    && request.status() == WorkerRequestStatus::InProgress
                {
                    self.processing_refused(&request);
                    break 'outer;
                }
                match request.execute() {
                    Ok(true) => {
                        self.processing_finished(&request);
                        break;
                    }
                    Ok(false) => time::sleep(Duration::from_millis(EXECUTE_INCREMENT_MS)).await,
                    Err(err) => {
                        warn!(worker = %self.worker, id = %request.id(), %err,
                              "request execution aborted");
                        self.processing_finished(&request);
                        break;
                    }
                }
            }
        }
        // last task out confirms the stop
        if self.active_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut queues = self.queues.lock().unwrap();
            queues.state = ProcessorState::Stopped;
            info!(worker = %self.worker, "processor stopped");
        }
    }

    /// Claim the highest-priority request from `new`, waiting up to
    /// `timeout` with short randomized polls.
    async fn fetch_next_for_processing(
        &self,
        stop: &AtomicBool,
        timeout: Duration,
    ) -> Option<Arc<WorkerRequest>> {
        let deadline = time::Instant::now() + timeout;
        loop {
            {
                let mut queues = self.queues.lock().unwrap();
                if let Some(index) = best_new_index(&queues.new) {
                    let request = queues.new.remove(index);
                    if let Err(err) = request.start() {
                        warn!(worker = %self.worker, id = %request.id(), %err,
                              "dropping unstartable request");
                        queues.finished.push(request);
                        continue;
                    }
                    queues.in_progress.push(request.clone());
                    return Some(request);
                }
            }
            if stop.load(Ordering::SeqCst) || time::Instant::now() >= deadline {
                return None;
            }
            let poll = rand::thread_rng().gen_range(1..=FETCH_POLL_MAX_MS);
            time::sleep(Duration::from_millis(poll)).await;
        }
    }

    /// Put an interrupted request back where it belongs.
    fn processing_refused(&self, request: &Arc<WorkerRequest>) {
        let mut queues = self.queues.lock().unwrap();
        queues.in_progress.retain(|r| r.id() != request.id());
        match request.rollback() {
            Ok(Rollback::Requeue) => queues.new.push(request.clone()),
            Ok(Rollback::Cancelled) => queues.finished.push(request.clone()),
            Err(err) => {
                warn!(worker = %self.worker, id = %request.id(), %err, "rollback failed");
                queues.finished.push(request.clone());
            }
        }
    }

    fn processing_finished(&self, request: &Arc<WorkerRequest>) {
        let mut queues = self.queues.lock().unwrap();
        queues.in_progress.retain(|r| r.id() != request.id());
        queues.finished.push(request.clone());
    }

    /// Admit one request. Responds `Queued` on success; `Bad` with a
    /// qualifying extended status when admission is refused.
    pub fn enqueue(&self, id: &str, body: RequestBody) -> ResponseFrame {
        let (priority, task) = match body {
            RequestBody::Replicate {
                priority,
                database,
                chunk,
                source_worker,
            } => {
                if !self.config.is_known_database(&database) {
                    return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
                }
                if !self.config.is_known_worker(&source_worker) || source_worker == self.worker {
                    return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
                }
                (
                    priority,
                    WorkerTask::Replicate {
                        database,
                        chunk,
                        source_worker,
                    },
                )
            }
            RequestBody::Delete {
                priority,
                database,
                chunk,
            } => {
                if !self.config.is_known_database(&database) {
                    return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
                }
                (priority, WorkerTask::Delete { database, chunk })
            }
            RequestBody::Find {
                priority,
                database,
                chunk,
                compute_cs,
            } => {
                if !self.config.is_known_database(&database) {
                    return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
                }
                (
                    priority,
                    WorkerTask::Find {
                        database,
                        chunk,
                        compute_cs,
                    },
                )
            }
            RequestBody::FindAll { priority, database } => {
                if !self.config.is_known_database(&database) {
                    return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
                }
                (priority, WorkerTask::FindAll { database })
            }
            RequestBody::Echo {
                priority,
                data,
                delay_ms,
            } => {
                if delay_ms == 0 {
                    // nothing to schedule
                    let mut response =
                        ResponseFrame::bare(id, ProtoStatus::Success, ProtoStatusExt::None);
                    let now = epoch_millis();
                    response.performance = crate::proto::WirePerformance {
                        receive_time: now,
                        start_time: now,
                        finish_time: now,
                    };
                    response.result = ResponseResult::Echo(data);
                    return response;
                }
                (priority, WorkerTask::Echo { data, delay_ms })
            }
            other => {
                warn!(worker = %self.worker, id, label = other.label(), "not an enqueueable request");
                return ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::InvalidParam);
            }
        };

        let request = WorkerRequest::new(id, priority, task, self.store.clone());

        let mut queues = self.queues.lock().unwrap();
        // refuse a second mutating request against the same replica
        if let Some((database, chunk)) = request.replica_target() {
            let collision = queues
                .new
                .iter()
                .chain(queues.in_progress.iter())
                .find(|r| r.replica_target() == Some((database, chunk)));
            if let Some(existing) = collision {
                debug!(worker = %self.worker, id, existing = %existing.id(), database, chunk,
                       "duplicate request refused");
                let mut response =
                    ResponseFrame::bare(id, ProtoStatus::Bad, ProtoStatusExt::Duplicate);
                response.duplicate_request_id = Some(existing.id().to_string());
                return response;
            }
        }
        let mut response = ResponseFrame::bare(id, ProtoStatus::Queued, ProtoStatusExt::None);
        response.performance = request.performance();
        queues.new.push(request);
        response
    }

    /// Report the current status of a previously submitted request.
    pub fn check_status(&self, wire_id: &str, target_id: &str) -> ResponseFrame {
        let queues = self.queues.lock().unwrap();
        match find_request(&queues, target_id) {
            Some(request) => response_for(wire_id, &request),
            None => ResponseFrame::bare(wire_id, ProtoStatus::Bad, ProtoStatusExt::InvalidId),
        }
    }

    /// Dequeue a waiting request or cancel a running one. The stop itself
    /// reports `Success` when the target exists; the target's fate rides
    /// along as the payload.
    pub fn dequeue_or_cancel(&self, wire_id: &str, target_id: &str) -> ResponseFrame {
        let mut queues = self.queues.lock().unwrap();
        if let Some(index) = queues.new.iter().position(|r| r.id() == target_id) {
            let request = queues.new.remove(index);
            request.cancel();
            queues.finished.push(request.clone());
            return stop_response(wire_id, &request);
        }
        if let Some(request) = queues
            .in_progress
            .iter()
            .find(|r| r.id() == target_id)
            .cloned()
        {
            // lands in `finished` when the executor observes the flag
            request.cancel();
            return stop_response(wire_id, &request);
        }
        if let Some(request) = queues
            .finished
            .iter()
            .find(|r| r.id() == target_id)
            .cloned()
        {
            return stop_response(wire_id, &request);
        }
        ResponseFrame::bare(wire_id, ProtoStatus::Bad, ProtoStatusExt::InvalidId)
    }

    /// Cancel everything that is not yet finished.
    pub fn drain(&self) {
        let mut queues = self.queues.lock().unwrap();
        info!(worker = %self.worker, num_new = queues.new.len(),
              num_in_progress = queues.in_progress.len(), "draining");
        for request in queues.new.drain(..).collect::<Vec<_>>() {
            request.cancel();
            queues.finished.push(request);
        }
        for request in &queues.in_progress {
            request.cancel();
        }
    }

    /// Snapshot of the queues.
    pub fn service_info(&self) -> ServiceState {
        let queues = self.queues.lock().unwrap();
        ServiceState {
            is_running: queues.state == ProcessorState::Running,
            start_time: self.start_time,
            num_new: queues.new.len(),
            num_in_progress: queues.in_progress.len(),
            num_finished: queues.finished.len(),
        }
    }
}

/// Index of the highest-priority queued request; ties go to the oldest.
fn best_new_index(new: &[Arc<WorkerRequest>]) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (index, request) in new.iter().enumerate() {
        let priority = request.priority();
        if best.map_or(true, |(_, p)| priority > p) {
            best = Some((index, priority));
        }
    }
    best.map(|(index, _)| index)
}

fn find_request(queues: &Queues, target_id: &str) -> Option<Arc<WorkerRequest>> {
    queues
        .new
        .iter()
        .chain(queues.in_progress.iter())
        .chain(queues.finished.iter())
        .find(|r| r.id() == target_id)
        .cloned()
}

fn wire_status(request: &WorkerRequest) -> ProtoStatus {
    match request.status() {
        WorkerRequestStatus::None => ProtoStatus::Queued,
        WorkerRequestStatus::InProgress => ProtoStatus::InProgress,
        WorkerRequestStatus::IsCancelling => ProtoStatus::IsCancelling,
        WorkerRequestStatus::Cancelled => ProtoStatus::Cancelled,
        WorkerRequestStatus::Succeeded => ProtoStatus::Success,
        WorkerRequestStatus::Failed => ProtoStatus::Failed,
    }
}

/// Translate a request's state into a wire response.
fn response_for(wire_id: &str, request: &WorkerRequest) -> ResponseFrame {
    let mut response = ResponseFrame::bare(wire_id, wire_status(request), request.status_ext());
    response.performance = request.performance();
    response.result = request.result();
    response
}

/// Response to a successful `Stop`: the management operation succeeded,
/// the target's status is the payload.
fn stop_response(wire_id: &str, request: &WorkerRequest) -> ResponseFrame {
    let mut response = ResponseFrame::bare(wire_id, ProtoStatus::Success, ProtoStatusExt::None);
    response.performance = request.performance();
    response.result = ResponseResult::Target(TargetStatus {
        status: wire_status(request),
        status_ext: request.status_ext(),
    });
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigData, FamilyInfo, WorkerInfo};
    use crate::worker_request::SimStore;
    use std::path::PathBuf;

    fn test_config() -> Arc<Config> {
        let mut data = ConfigData::default();
        for name in ["w1", "w2"] {
            data.workers.insert(
                name.into(),
                WorkerInfo {
                    name: name.into(),
                    svc_host: "127.0.0.1".into(),
                    svc_port: 0,
                    fs_host: "127.0.0.1".into(),
                    fs_port: 0,
                    data_dir: PathBuf::from("/tmp"),
                    is_enabled: true,
                    is_read_only: false,
                },
            );
        }
        data.families.insert(
            "production".into(),
            FamilyInfo {
                name: "production".into(),
                replication_level: 2,
                databases: vec!["sky_dr1".into()],
            },
        );
        data.fetch_timeout_ms = 50;
        Config::in_memory(data)
    }

    fn processor() -> Arc<WorkerProcessor> {
        WorkerProcessor::new("w1", test_config(), Arc::new(SimStore::new("w1", 1.0, 7)))
    }

    fn replicate_body(database: &str, chunk: u32) -> RequestBody {
        RequestBody::Replicate {
            priority: 0,
            database: database.into(),
            chunk,
            source_worker: "w2".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_replica_target_is_refused_with_colliding_id() {
        let processor = processor();
        let first = processor.enqueue("r1", replicate_body("sky_dr1", 7));
        assert_eq!(first.status, ProtoStatus::Queued);

        let second = processor.enqueue(
            "r2",
            RequestBody::Delete {
                priority: 0,
                database: "sky_dr1".into(),
                chunk: 7,
            },
        );
        assert_eq!(second.status, ProtoStatus::Bad);
        assert_eq!(second.status_ext, ProtoStatusExt::Duplicate);
        assert_eq!(second.duplicate_request_id.as_deref(), Some("r1"));

        // a different chunk is fine
        let third = processor.enqueue("r3", replicate_body("sky_dr1", 8));
        assert_eq!(third.status, ProtoStatus::Queued);
    }

    #[tokio::test]
    async fn unknown_database_or_source_worker_is_invalid() {
        let processor = processor();
        let response = processor.enqueue("r1", replicate_body("nope", 1));
        assert_eq!(response.status, ProtoStatus::Bad);
        assert_eq!(response.status_ext, ProtoStatusExt::InvalidParam);

        let response = processor.enqueue(
            "r2",
            RequestBody::Replicate {
                priority: 0,
                database: "sky_dr1".into(),
                chunk: 1,
                source_worker: "w1".into(),
            },
        );
        assert_eq!(response.status_ext, ProtoStatusExt::InvalidParam);
    }

    #[tokio::test]
    async fn fetch_prefers_higher_priority_then_age() {
        let processor = processor();
        processor.enqueue(
            "low",
            RequestBody::Find {
                priority: -1,
                database: "sky_dr1".into(),
                chunk: 1,
                compute_cs: false,
            },
        );
        processor.enqueue(
            "high",
            RequestBody::Find {
                priority: 5,
                database: "sky_dr1".into(),
                chunk: 2,
                compute_cs: false,
            },
        );
        processor.enqueue(
            "high2",
            RequestBody::Find {
                priority: 5,
                database: "sky_dr1".into(),
                chunk: 3,
                compute_cs: false,
            },
        );

        let stop = AtomicBool::new(false);
        let timeout = Duration::from_millis(100);
        let a = processor
            .fetch_next_for_processing(&stop, timeout)
            .await
            .unwrap();
        let b = processor
            .fetch_next_for_processing(&stop, timeout)
            .await
            .unwrap();
        let c = processor
            .fetch_next_for_processing(&stop, timeout)
            .await
            .unwrap();
        assert_eq!(a.id(), "high");
        assert_eq!(b.id(), "high2");
        assert_eq!(c.id(), "low");
    }

    #[tokio::test]
    async fn status_and_stop_of_unknown_id_is_invalid() {
        let processor = processor();
        let response = processor.check_status("w1", "nope");
        assert_eq!(response.status, ProtoStatus::Bad);
        assert_eq!(response.status_ext, ProtoStatusExt::InvalidId);
        let response = processor.dequeue_or_cancel("w2", "nope");
        assert_eq!(response.status_ext, ProtoStatusExt::InvalidId);
    }

    #[tokio::test]
    async fn stop_on_queued_request_cancels_and_keeps_it_queryable() {
        let processor = processor();
        processor.enqueue("r1", replicate_body("sky_dr1", 1));
        // the stop succeeds; the target's fate is the payload
        let response = processor.dequeue_or_cancel("w1", "r1");
        assert_eq!(response.status, ProtoStatus::Success);
        match response.result {
            ResponseResult::Target(target) => assert_eq!(target.status, ProtoStatus::Cancelled),
            other => panic!("unexpected result: {other:?}"),
        }
        // still visible for status queries
        let response = processor.check_status("w2", "r1");
        assert_eq!(response.status, ProtoStatus::Cancelled);
        // and its replica target is free again
        let response = processor.enqueue("r2", replicate_body("sky_dr1", 1));
        assert_eq!(response.status, ProtoStatus::Queued);
    }

    #[tokio::test]
    async fn instant_echo_short_circuits_the_queue() {
        let processor = processor();
        let response = processor.enqueue(
            "r1",
            RequestBody::Echo {
                priority: 0,
                data: b"ping".to_vec(),
                delay_ms: 0,
            },
        );
        assert_eq!(response.status, ProtoStatus::Success);
        match response.result {
            ResponseResult::Echo(data) => assert_eq!(data, b"ping"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(processor.service_info().num_new, 0);
    }

    #[tokio::test]
    async fn refused_request_goes_back_to_the_new_queue() {
        let processor = processor();
        processor.enqueue(
            "r1",
            RequestBody::Echo {
                priority: 0,
                data: vec![],
                delay_ms: 60_000,
            },
        );
        let stop = AtomicBool::new(false);
        let request = processor
            .fetch_next_for_processing(&stop, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(processor.service_info().num_in_progress, 1);
        processor.processing_refused(&request);
        let info = processor.service_info();
        assert_eq!(info.num_in_progress, 0);
        assert_eq!(info.num_new, 1);
        assert_eq!(request.status(), WorkerRequestStatus::None);
    }

    #[tokio::test]
    async fn run_executes_queued_requests_and_stop_confirms() {
        let processor = processor();
        processor.run();
        assert_eq!(processor.state(), ProcessorState::Running);
        processor.enqueue("r1", replicate_body("sky_dr1", 3));

        // wait for the pool to finish the request
        for _ in 0..200 {
            if processor.check_status("w1", "r1").status == ProtoStatus::Success {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.check_status("w1", "r1").status, ProtoStatus::Success);

        processor.stop();
        for _ in 0..200 {
            if processor.state() == ProcessorState::Stopped {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test]
    async fn drain_cancels_queued_work() {
        let processor = processor();
        processor.enqueue("r1", replicate_body("sky_dr1", 1));
        processor.enqueue("r2", replicate_body("sky_dr1", 2));
        processor.drain();
        let info = processor.service_info();
        assert_eq!(info.num_new, 0);
        assert_eq!(info.num_finished, 2);
        assert_eq!(processor.check_status("w1", "r1").status, ProtoStatus::Cancelled);
    }
}
