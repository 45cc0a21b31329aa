//! skyrepl command line: worker node and one-shot controller operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use skyrepl::config::Config;
use skyrepl::controller::Controller;
use skyrepl::delete_worker_job::DeleteWorkerJob;
use skyrepl::find_all_job::FindAllJob;
use skyrepl::job::JobExtendedState;
use skyrepl::query_mgt::LocalQueryService;
use skyrepl::query_sync_job::QuerySyncJob;
use skyrepl::registry::MemoryRegistry;
use skyrepl::replicate_job::ReplicateJob;
use skyrepl::request::RequestOptions;
use skyrepl::verify_job::VerifyJob;
use skyrepl::worker_server::WorkerServer;

#[derive(Parser)]
#[command(name = "skyrepl", version, about = "Replication control plane for a chunked SQL database")]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one worker's replication service.
    Worker {
        /// Worker name, as known to the configuration.
        name: String,
    },
    /// Bring a family's chunks up to the replication level.
    Replicate {
        family: String,
        /// Desired replicas per chunk; 0 uses the configured level.
        #[arg(long, default_value_t = 0)]
        replicas: usize,
    },
    /// Discover replica placement across a family.
    FindAll { family: String },
    /// Continuously verify replicas, oldest first, until interrupted.
    Verify {
        /// Verification window size.
        #[arg(long, default_value_t = 4)]
        max_replicas: usize,
        /// Also compare file checksums.
        #[arg(long)]
        checksum: bool,
    },
    /// Decommission a worker.
    DeleteWorker {
        name: String,
        /// Also remove the worker from the configuration.
        #[arg(long)]
        permanent: bool,
    },
    /// Push authoritative replica sets to the query layer.
    Sync {
        family: String,
        /// Replace replica sets even when chunks are in use.
        #[arg(long)]
        force: bool,
    },
    /// Round-trip a payload through a worker.
    Echo {
        worker: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

fn controller(config: Arc<Config>) -> Arc<Controller> {
    Controller::new(config, Arc::new(MemoryRegistry::new()), LocalQueryService::new())
}

fn check_job(kind: &str, extended: JobExtendedState) -> anyhow::Result<()> {
    if extended != JobExtendedState::Success {
        bail!("{kind} job finished with {}", extended.label());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Worker { name } => {
            let server = WorkerServer::spawn(config, &name).await?;
            info!(worker = %name, addr = %server.local_addr(), "serving; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            server.shutdown();
        }
        Command::Replicate { family, replicas } => {
            let job = ReplicateJob::create(
                controller(config),
                &family,
                replicas,
                None,
                ReplicateJob::default_options(),
                None,
            );
            job.start()?;
            job.await_finished().await;
            check_job("replicate", job.core().extended_state())?;
            let result = job.result()?;
            info!(
                family = %family,
                num_created = result.replicas.len(),
                num_iterations = job.num_iterations(),
                "replication level restored"
            );
        }
        Command::FindAll { family } => {
            let job = FindAllJob::create(
                controller(config),
                &family,
                None,
                FindAllJob::default_options(),
                None,
            )?;
            job.start()?;
            job.await_finished().await;
            check_job("find-all", job.core().extended_state())?;
            let result = job.result()?;
            for (chunk, workers) in &result.is_good {
                let good: Vec<&str> = workers
                    .iter()
                    .filter(|(_, good)| **good)
                    .map(|(worker, _)| worker.as_str())
                    .collect();
                println!("chunk {chunk}: {} good replica(s) on {good:?}", good.len());
            }
            info!(family = %family, num_chunks = result.chunks.len(), "discovery complete");
        }
        Command::Verify {
            max_replicas,
            checksum,
        } => {
            let job = VerifyJob::create(
                controller(config),
                max_replicas,
                checksum,
                None,
                VerifyJob::default_options(),
                Some(Arc::new(|_job, self_diff, other_diffs| {
                    if self_diff.not_equal() {
                        let replica = self_diff.replica1();
                        println!(
                            "mismatch {}:{} on {}: {}",
                            replica.database,
                            replica.chunk,
                            replica.worker,
                            self_diff.flags()
                        );
                    }
                    for diff in other_diffs {
                        if diff.not_equal() {
                            println!(
                                "divergence {}:{} between {} and {}: {}",
                                diff.replica1().database,
                                diff.replica1().chunk,
                                diff.replica1().worker,
                                diff.replica2().worker,
                                diff.flags()
                            );
                        }
                    }
                })),
                None,
            );
            job.start()?;
            tokio::select! {
                _ = job.await_finished() => {}
                _ = tokio::signal::ctrl_c() => job.cancel(),
            }
        }
        Command::DeleteWorker { name, permanent } => {
            let job = DeleteWorkerJob::create(
                controller(config),
                &name,
                permanent,
                None,
                DeleteWorkerJob::default_options(),
                None,
            );
            job.start()?;
            job.await_finished().await;
            check_job("delete-worker", job.core().extended_state())?;
            let result = job.result()?;
            for (chunk, databases) in &result.orphan_chunks {
                println!("orphaned chunk {chunk}: {:?}", databases.keys().collect::<Vec<_>>());
            }
            info!(worker = %name, permanent, "worker decommissioned");
        }
        Command::Sync { family, force } => {
            let job = QuerySyncJob::create(
                controller(config),
                &family,
                force,
                None,
                QuerySyncJob::default_options(),
                None,
            );
            job.start()?;
            job.await_finished().await;
            check_job("sync", job.core().extended_state())?;
            info!(family = %family, "query layer synchronized");
        }
        Command::Echo {
            worker,
            data,
            delay_ms,
        } => {
            let request = controller(config).echo(
                &worker,
                data.into_bytes(),
                delay_ms,
                RequestOptions {
                    keep_tracking: true,
                    ..Default::default()
                },
                None,
                None,
            )?;
            request.await_finished().await;
            match request.echo_data() {
                Some(data) => println!("{}", String::from_utf8_lossy(&data)),
                None => bail!(
                    "echo finished with {}",
                    request.extended_state().label()
                ),
            }
        }
    }
    Ok(())
}
