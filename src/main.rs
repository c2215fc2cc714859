use anyhow::Result;
use clap::{Parser, Subcommand};
use fairq::config::LoggingConfig;
use fairq::{FairQueue, QueueConfig, UrlPayload};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "fairq",
    version,
    about = "Distributed fair-dispatch job queue with per-destination concurrency limits",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults to FAIRQ_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (overrides `logging.level`)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (overrides `logging.format`)
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a URL
    Push {
        url: String,

        /// Jobs of this host allowed to run at once
        #[arg(short = 'n', long, default_value = "1")]
        concurrency: u32,

        /// Dispatch before everything already queued for the host
        #[arg(long, default_value = "false")]
        front: bool,
    },

    /// Drop a queued job by key
    Remove { key: String },

    /// Drop every queued job of a destination
    Purge { destination: String },

    /// Show slot and backlog counts
    Stats { destination: Option<String> },

    /// List destinations in the rotation
    Hosts {
        /// Show checked-out slots instead of available ones
        #[arg(long, default_value = "false")]
        pending: bool,
    },

    /// Recover jobs left in flight by dead instances
    Recover,

    /// Run a worker that logs each job it receives
    Worker {
        #[arg(short = 'n', long, default_value = "4")]
        concurrency: usize,

        /// Simulated processing time per job in milliseconds
        #[arg(long, default_value = "250")]
        work_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => QueueConfig::from_file(path)?,
        None => QueueConfig::from_env()?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    setup_tracing(&config.logging)?;

    tracing::debug!(queue = %config.name, redis = %config.redis.url, "Connecting");
    let queue: FairQueue<UrlPayload> = FairQueue::new(config).await?;

    let result = run(&queue, cli.command).await;
    queue.close(true).await?;
    result
}

async fn run(queue: &FairQueue<UrlPayload>, command: Commands) -> Result<()> {
    match command {
        Commands::Push {
            url,
            concurrency,
            front,
        } => {
            let payload = UrlPayload::new(url);
            let admission = if front {
                queue.unshift(&payload, concurrency).await?
            } else {
                queue.push(&payload, concurrency).await?
            };
            match admission.correlation_id() {
                Some(id) => println!("Admitted: {id}"),
                None => println!("Not admitted: {} is already queued", payload.url),
            }
        }

        Commands::Remove { key } => {
            if queue.remove(&key).await? {
                println!("Removed: {key}");
            } else {
                println!("Not queued: {key}");
            }
        }

        Commands::Purge { destination } => {
            let purged = queue.purge(&destination).await?;
            println!("Purged {purged} job(s) of {destination}");
        }

        Commands::Stats { destination } => {
            let stats = queue.stats(destination.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Hosts { pending } => {
            let counts = if pending {
                queue.pending_host_counts().await?
            } else {
                queue.queued_host_counts().await?
            };
            let mut hosts: Vec<_> = counts.into_iter().collect();
            hosts.sort();
            for (host, count) in hosts {
                println!("{count:>5}  {host}");
            }
        }

        Commands::Recover => {
            let recovered = queue.wake_up().await?;
            println!("Recovered {recovered} job(s)");
        }

        Commands::Worker {
            concurrency,
            work_ms,
        } => {
            if let Err(e) = fairq::metrics::init_metrics() {
                tracing::warn!(error = %e, "Metrics unavailable");
            }

            let work = Duration::from_millis(work_ms);
            let worker = queue.process(concurrency, move |job: UrlPayload| async move {
                tracing::info!(url = %job.url, "Processing");
                tokio::time::sleep(work).await;
                Ok::<_, std::convert::Infallible>(job.url)
            })?;

            tracing::info!("Worker running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;

            tracing::info!("Shutting down, waiting for running jobs");
            queue.close(true).await?;
            worker.await??;

            if let Ok(text) = fairq::metrics::encode_metrics() {
                tracing::debug!(metrics = %text, "Final metrics");
            }
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(logging.filter_directive());

    if logging.is_json() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}
