//! The controller: the single front end through which requests and jobs
//! reach workers and the query layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use crate::chunk::ChunkLocker;
use crate::config::Config;
use crate::messenger::Messenger;
use crate::query_mgt::{QueryMgtServices, QueryService};
use crate::registry::ReplicaRegistry;
use crate::request::{
    Request, RequestCallback, RequestKind, RequestOptions, RequestServices,
};

/// Process-unique id source for requests and jobs.
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:012x}", self.prefix, n)
    }
}

/// The controller.
pub struct Controller {
    services: Arc<RequestServices>,
    locker: Arc<ChunkLocker>,
    query_mgt: Arc<QueryMgtServices>,
    idgen: Arc<IdGenerator>,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<dyn ReplicaRegistry>,
        query_service: Arc<dyn QueryService>,
    ) -> Arc<Self> {
        let idgen = Arc::new(IdGenerator::new("skyrepl"));
        let messenger = Messenger::new(config.clone());
        info!("controller starting");
        Arc::new(Self {
            services: Arc::new(RequestServices {
                config,
                registry,
                messenger,
            }),
            locker: Arc::new(ChunkLocker::new()),
            query_mgt: QueryMgtServices::new(query_service, idgen.clone()),
            idgen,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.services.config
    }

    pub fn registry(&self) -> &Arc<dyn ReplicaRegistry> {
        &self.services.registry
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.services.messenger
    }

    pub fn locker(&self) -> &Arc<ChunkLocker> {
        &self.locker
    }

    pub fn query_mgt(&self) -> &Arc<QueryMgtServices> {
        &self.query_mgt
    }

    pub fn idgen(&self) -> &Arc<IdGenerator> {
        &self.idgen
    }

    /// Stop the messenger; every in-flight request fails over to
    /// `CLIENT_ERROR`.
    pub fn shutdown(&self) {
        info!("controller shutting down");
        self.services.messenger.stop();
    }

    fn check_worker(&self, worker: &str) -> anyhow::Result<()> {
        if !self.services.config.is_known_worker(worker) {
            bail!("unknown worker: {worker}");
        }
        Ok(())
    }

    fn check_database(&self, database: &str) -> anyhow::Result<()> {
        if !self.services.config.is_known_database(database) {
            bail!("unknown database: {database}");
        }
        Ok(())
    }

    fn submit(
        &self,
        worker: &str,
        kind: RequestKind,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        let request = Request::new(
            self.services.clone(),
            self.idgen.next(),
            kind,
            worker.to_string(),
            options,
            on_finish,
        );
        request
            .start(job_id.map(str::to_string))
            .with_context(|| format!("submitting request to worker {worker}"))?;
        Ok(request)
    }

    /// Create a replica of a chunk on `destination`, pulling from `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn replicate(
        &self,
        destination: &str,
        source: &str,
        database: &str,
        chunk: u32,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(destination)?;
        self.check_worker(source)?;
        self.check_database(database)?;
        if destination == source {
            bail!("source and destination workers are the same: {source}");
        }
        self.submit(
            destination,
            RequestKind::Replicate {
                database: database.to_string(),
                chunk,
                source_worker: source.to_string(),
            },
            options,
            job_id,
            on_finish,
        )
    }

    /// Delete a chunk replica from a worker.
    pub fn delete_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.check_database(database)?;
        self.submit(
            worker,
            RequestKind::Delete {
                database: database.to_string(),
                chunk,
            },
            options,
            job_id,
            on_finish,
        )
    }

    /// Inspect one chunk replica on a worker.
    pub fn find_replica(
        &self,
        worker: &str,
        database: &str,
        chunk: u32,
        compute_cs: bool,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.check_database(database)?;
        self.submit(
            worker,
            RequestKind::Find {
                database: database.to_string(),
                chunk,
                compute_cs,
            },
            options,
            job_id,
            on_finish,
        )
    }

    /// Inspect every replica of one database on a worker.
    pub fn find_all_replicas(
        &self,
        worker: &str,
        database: &str,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.check_database(database)?;
        self.submit(
            worker,
            RequestKind::FindAll {
                database: database.to_string(),
            },
            options,
            job_id,
            on_finish,
        )
    }

    /// Round-trip a payload through a worker, optionally with a simulated
    /// processing delay.
    pub fn echo(
        &self,
        worker: &str,
        data: Vec<u8>,
        delay_ms: u64,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.submit(
            worker,
            RequestKind::Echo { data, delay_ms },
            options,
            job_id,
            on_finish,
        )
    }

    /// Dequeue or cancel a previously submitted request on a worker.
    pub fn stop_request(
        &self,
        worker: &str,
        target_id: &str,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.submit(
            worker,
            RequestKind::Stop {
                target_id: target_id.to_string(),
            },
            options,
            job_id,
            on_finish,
        )
    }

    /// Query a worker's processor queues.
    pub fn status_of_worker_service(
        &self,
        worker: &str,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.submit(worker, RequestKind::ServiceStatus, options, job_id, on_finish)
    }

    /// Cancel all queued and running requests on a worker.
    pub fn drain_worker_service(
        &self,
        worker: &str,
        options: RequestOptions,
        job_id: Option<&str>,
        on_finish: Option<RequestCallback>,
    ) -> anyhow::Result<Arc<Request>> {
        self.check_worker(worker)?;
        self.submit(worker, RequestKind::ServiceDrain, options, job_id, on_finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_produces_unique_prefixed_ids() {
        let idgen = IdGenerator::new("skyrepl");
        let a = idgen.next();
        let b = idgen.next();
        assert_ne!(a, b);
        assert!(a.starts_with("skyrepl-"));
    }
}
