use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use trogon_crontab::{NatsJobCatalog, NatsLockStore, ShellConfig, Worker, WorkerConfig, kv};

/// Crontab worker CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// NATS URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Worker id used as lock holder (random if unset)
    #[arg(long, env = "CRONTAB_WORKER_ID")]
    worker_id: Option<String>,

    /// Longest sleep between due-scans, in milliseconds
    #[arg(long, env = "CRONTAB_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Job lock lease TTL, in seconds
    #[arg(long, env = "CRONTAB_LOCK_TTL_SECS", default_value_t = 10)]
    lock_ttl_secs: u64,

    /// Time between SIGTERM and SIGKILL when a job is cancelled, in seconds
    #[arg(long, env = "CRONTAB_KILL_GRACE_SECS", default_value_t = 5)]
    kill_grace_secs: u64,

    /// Shell used to run job commands
    #[arg(long, env = "CRONTAB_SHELL", default_value = "sh")]
    shell: String,

    /// Argument passed to the shell before the command
    #[arg(long, env = "CRONTAB_SHELL_ARG", default_value = "-c")]
    shell_arg: String,
}

impl Args {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .with_kill_grace(Duration::from_secs(self.kill_grace_secs))
            .with_shell(ShellConfig::new(self.shell.clone(), vec![self.shell_arg.clone()]));
        if let Some(id) = &self.worker_id {
            config = config.with_worker_id(id.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.worker_config();

    tracing::info!(nats_url = %args.nats_url, "Connecting to NATS");

    let nats = async_nats::connect(&args.nats_url)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        });

    let js = async_nats::jetstream::new(nats.clone());
    let buckets = async {
        let jobs = kv::get_or_create_jobs_bucket(&js).await?;
        let locks = kv::get_or_create_locks_bucket(&js, config.lock_ttl).await?;
        Ok::<_, trogon_crontab::CronError>((jobs, locks))
    };
    let (jobs, locks) = buckets.await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to open KV buckets");
        std::process::exit(1);
    });

    let worker = Worker::new(
        config,
        NatsJobCatalog::new(jobs, locks.clone()),
        NatsLockStore::new(locks),
        nats,
    )
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
        std::process::exit(1);
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    worker.run(shutdown).await;
}

/// Resolves when the process receives SIGINT or SIGTERM.
///
/// SIGTERM matters for container orchestrators (`docker stop`, pod
/// termination). On non-Unix only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => {}
        _ = sigterm => {}
    }
}
