//! Replication control plane for a chunked, sky-partitioned SQL database.
//!
//! The controller side tracks, repairs and verifies the chunk-to-worker
//! replica mapping through asynchronous jobs and requests; the worker side
//! executes replica operations from a prioritized queue behind a framed
//! TCP protocol.

pub mod chunk;
pub mod config;
pub mod controller;
pub mod create_replica_job;
pub mod delete_worker_job;
pub mod find_all_job;
pub mod job;
pub mod messenger;
pub mod proto;
pub mod query_mgt;
pub mod query_sync_job;
pub mod registry;
pub mod replica;
pub mod replicate_job;
pub mod request;
pub mod verify_job;
pub mod worker_processor;
pub mod worker_request;
pub mod worker_server;

use std::time::{SystemTime, UNIX_EPOCH};

/// Return current epoch time in milliseconds (saturating).
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}
