//! s3-migrate CLI - queue-driven S3 bucket migration.

mod aws;

use clap::{Parser, Subcommand};
use s3_migrate::{
    Config, DynamoLedger, Environment, InMemoryLedger, MigrateError, ProgressLedger, S3Store,
    SqsQueue,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "s3-migrate")]
#[command(about = "Distributed S3-to-S3 bucket migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer worker loop against the job queue
    Worker {
        /// Override the number of objects transferred in parallel
        #[arg(long)]
        parallel_files: Option<usize>,

        /// Seconds to wait after an empty poll (default: 60)
        #[arg(long, default_value = "60")]
        poll_idle: u64,
    },

    /// Diff source against destination and enqueue the missing objects
    Send,

    /// Check connectivity to both buckets and the queue
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Worker {
            parallel_files,
            poll_idle,
        } => {
            if let Some(n) = parallel_files {
                config.transfer.max_parallel_files = Some(n);
            }
            let env = build_environment(config).await?;
            let cancel_token = setup_signal_handler()?;
            let looper = Arc::new(env.looper().with_idle(
                std::time::Duration::from_secs(poll_idle),
                std::time::Duration::from_secs(5),
            ));
            info!(
                "worker {} polling queue with {} parallel slots",
                env.worker_id,
                env.config.transfer.get_max_parallel_files()
            );
            looper.run(cancel_token).await;
        }

        Commands::Send => {
            let env = build_environment(config).await?;
            let sent = env.sender().run().await?;
            println!("\nBatch sent!");
            println!("  Jobs enqueued: {}", sent);
        }

        Commands::HealthCheck => {
            let env = build_environment(config).await?;
            env.src
                .list_objects(&env.config.source.bucket, &env.config.source.prefix)
                .await?;
            env.des
                .list_objects(&env.config.target.bucket, &env.config.target.prefix)
                .await?;
            env.queue.is_empty().await?;
            println!("All connections OK");
        }
    }

    Ok(())
}

async fn build_environment(config: Config) -> Result<Environment, MigrateError> {
    let src = Arc::new(S3Store::new(aws::s3_client(&config.source).await));
    let des = Arc::new(S3Store::new(aws::s3_client(&config.target).await));

    let ambient = aws::ambient_config().await;
    let queue = Arc::new(SqsQueue::connect(aws::sqs_client(&ambient), &config.queue.name).await?);
    let ledger: Arc<dyn ProgressLedger> = if config.ledger.table.is_empty() {
        warn!("no ledger table configured, progress is not persisted");
        Arc::new(InMemoryLedger::new())
    } else {
        Arc::new(DynamoLedger::new(
            aws::dynamodb_client(&ambient),
            config.ledger.table.clone(),
        ))
    };

    Ok(Environment::new(src, des, queue, ledger, config))
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Finishing current rounds, jobs stay on the queue...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Finishing current rounds, jobs stay on the queue...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C).
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing current rounds, jobs stay on the queue...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
