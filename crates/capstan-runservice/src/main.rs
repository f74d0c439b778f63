//! # capstan-runservice binary
//!
//! The run scheduling engine process. Hosts the leader-gated loops:
//! the run engine tick, the WAL checkpointer and the terminal-run
//! collector. Non-leaders keep their ReadDB projection warm and wait.
//!
//! ## Exit codes
//!
//! - `0` - normal shutdown
//! - `1` - unrecoverable startup failure
//! - `2` - coordination lease lost beyond its TTL

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use capstan_core::kv::KvStore;
use capstan_core::storage::StorageBackend;
use capstan_core::{
    init_logging, paths, Campaign, Config, LeaderElection, LogFormat, MemoryKv, ObjectStoreBackend,
};
use capstan_datamanager::{Checkpointer, DataManager, ReadDb};
use capstan_runservice::{Engine, ExecutorRegistry, RunCollector};

/// WAL entries kept behind the checkpoint for late readers.
const WAL_RETENTION_ENTRIES: u64 = 100;

/// Capstan run scheduling engine.
#[derive(Debug, Parser)]
#[command(name = "capstan-runservice")]
#[command(about = "Drives runs from queued to finished on a pool of executors")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CAPSTAN_CONFIG")]
    config: String,

    /// Instance identifier used in leader election.
    #[arg(long, env = "CAPSTAN_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Emit JSON logs instead of pretty ones.
    #[arg(long, env = "CAPSTAN_LOG_JSON")]
    log_json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {}", args.config))?;
    let config = Config::from_json(&raw).context("parsing configuration")?;

    let storage: Arc<dyn StorageBackend> =
        Arc::new(ObjectStoreBackend::from_config(&config.object_storage)?);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let dm = Arc::new(DataManager::new(kv.clone(), storage.clone()));
    let readdb = ReadDb::new(kv.clone(), storage.clone());
    readdb.start().await.context("starting readdb")?;

    let registry = ExecutorRegistry::new(
        kv.clone(),
        Duration::from_secs(config.executor_heartbeat_interval),
    );
    let engine = Engine::new(dm.clone(), readdb.clone(), registry);
    let checkpointer = Checkpointer::new(kv.clone(), storage.clone(), WAL_RETENTION_ENTRIES);
    let collector = RunCollector::new(
        dm.clone(),
        readdb.clone(),
        storage.clone(),
        config.run_cache_expire(),
    );

    let instance_id = args
        .instance_id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let lease_ttl = Duration::from_secs(config.leader_lease_ttl);
    let election = LeaderElection::new(kv, paths::WAL_LEADER_KEY, &instance_id, lease_ttl);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(instance = %instance_id, "runservice started");

    let mut shutdown = shutdown_rx.clone();
    loop {
        if *shutdown.borrow() {
            return Ok(ExitCode::SUCCESS);
        }

        match election.try_acquire().await? {
            Campaign::Acquired(lease) => {
                tracing::info!(instance = %instance_id, "acting as leader");

                let engine_loop = engine.run_loop(
                    Duration::from_secs(config.scheduler_interval),
                    shutdown_rx.clone(),
                );
                tokio::pin!(engine_loop);

                let mut checkpoint_ticker =
                    tokio::time::interval(Duration::from_secs(config.checkpoint_interval));
                let mut renew_ticker = tokio::time::interval(lease_ttl / 2);
                let mut gc_ticker =
                    tokio::time::interval(Duration::from_secs(config.checkpoint_interval * 6));

                loop {
                    tokio::select! {
                        () = &mut engine_loop => {
                            // Engine loop only returns on shutdown.
                            let _ = lease.resign().await;
                            return Ok(ExitCode::SUCCESS);
                        }
                        _ = renew_ticker.tick() => {
                            if !lease.renew().await? {
                                tracing::error!("coordination lease lost beyond ttl");
                                return Ok(ExitCode::from(2));
                            }
                        }
                        _ = checkpoint_ticker.tick() => {
                            if let Err(e) = checkpointer.checkpoint(&dm).await {
                                tracing::warn!(error = %e, "checkpoint failed");
                            } else if let Err(e) = checkpointer.gc(&dm).await {
                                tracing::warn!(error = %e, "wal gc failed");
                            }
                        }
                        _ = gc_ticker.tick() => {
                            if let Err(e) = collector.collect().await {
                                tracing::warn!(error = %e, "run expiry failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = lease.resign().await;
                                return Ok(ExitCode::SUCCESS);
                            }
                        }
                    }
                }
            }
            Campaign::NotLeader { current_leader } => {
                tracing::debug!(leader = ?current_leader, "standing by");
                tokio::select! {
                    () = tokio::time::sleep(lease_ttl) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
