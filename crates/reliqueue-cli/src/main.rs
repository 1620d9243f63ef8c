//! Offline inspection and repair tool for a reliable queue backend,
//! in the spirit of `spool-util`: point it at a config file describing
//! one backend and ask it to report on or nudge that backend's state.

use clap::{Parser, Subcommand};
use reliqueue_core::Queue;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Reliable queue inspection utility.
///
/// Operates against a single backend described by `--config`; not
/// safe to run concurrently against a backend another process is
/// actively reading SKIP LOCKED-style from, since `orphans` and
/// `requeue-orphans` read and then mutate state non-atomically at the
/// CLI layer.
#[derive(Debug, Parser)]
struct Opt {
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print queue and ephemeral storage sizes.
    Size,
    /// List ephemeral entries older than `--threshold-ms`.
    Orphans {
        #[arg(long, default_value_t = 30_000)]
        threshold_ms: i64,
    },
    /// Requeue every orphan older than `--threshold-ms`.
    RequeueOrphans {
        #[arg(long, default_value_t = 30_000)]
        threshold_ms: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
enum BackendConfig {
    Sql(reliqueue_sql::SqlQueueConfig),
    SqlLessLocking(reliqueue_sql::SqlLessLockingQueueConfig),
    Redis(reliqueue_redis::RedisQueueConfig),
    Disruptor(reliqueue_core::DisruptorQueueConfig),
}

fn open_backend(config: BackendConfig) -> anyhow::Result<Arc<dyn Queue>> {
    Ok(match config {
        BackendConfig::Sql(cfg) => Arc::new(reliqueue_sql::TwoTableQueue::open(&cfg)?),
        BackendConfig::SqlLessLocking(cfg) => {
            Arc::new(reliqueue_sql::SqlLessLockingQueue::open(&cfg)?)
        }
        BackendConfig::Redis(cfg) => Arc::new(reliqueue_redis::RedisQueue::open(&cfg)?),
        BackendConfig::Disruptor(cfg) => Arc::new(reliqueue_core::DisruptorQueue::open(&cfg)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opt::parse();
    let text = std::fs::read_to_string(&opts.config)?;
    let config: BackendConfig = toml::from_str(&text)?;
    let queue = open_backend(config)?;

    match opts.cmd {
        Command::Size => {
            println!("queue_size = {}", queue.queue_size().await?);
            println!("ephemeral_size = {}", queue.ephemeral_size().await?);
        }
        Command::Orphans { threshold_ms } => {
            for msg in queue.orphans(threshold_ms).await? {
                println!(
                    "{} requeues={} age_ok_at={}",
                    msg.id,
                    msg.num_requeues,
                    msg.timestamp
                );
            }
        }
        Command::RequeueOrphans { threshold_ms } => {
            let orphans = queue.orphans(threshold_ms).await?;
            let mut requeued = 0usize;
            for msg in orphans {
                let id = msg.id.clone();
                if queue.requeue(msg).await? {
                    requeued += 1;
                } else {
                    tracing::warn!(%id, "requeue did not commit, leaving ephemeral entry in place");
                }
            }
            println!("requeued {requeued} orphan(s)");
        }
    }

    Ok(())
}
