//! leaseq CLI — operator interface to lease queues.

use clap::{Parser, Subcommand};
use leaseq::config::Config;
use leaseq::db::Db;
use leaseq::model::{LeaseTag, RetryPolicy};
use leaseq::queue::{Queue, QueueOptions};
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "leaseq", about = "Lease-based work queue on Postgres")]
struct Cli {
    /// Queue name
    #[arg(long, default_value = "mq", global = true)]
    queue: String,
    /// Default lease duration in seconds
    #[arg(long, default_value_t = 30, global = true)]
    ttl: u64,
    /// Maximum claims per task before it is terminally failed
    #[arg(long, default_value_t = 10, global = true)]
    tries: u32,
    /// Retry forever; tasks never fail terminally
    #[arg(long, global = true)]
    unlimited: bool,
    /// Prefer recently-retried tasks when claiming
    #[arg(long, global = true)]
    insistent: bool,
    /// Treat an empty claim as an error carrying a stats snapshot
    #[arg(long, global = true)]
    strict: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert payloads (JSON values; bare words become JSON strings)
    Add { items: Vec<String> },
    /// Claim one task
    Get {
        /// Lease duration in seconds (defaults to --ttl)
        #[arg(long)]
        lease: Option<u64>,
    },
    /// Extend a live lease
    Ping {
        /// Lease tag issued by a previous get
        tag: LeaseTag,
        /// Lease duration in seconds (defaults to --ttl)
        #[arg(long)]
        lease: Option<u64>,
    },
    /// Complete the task held under a live lease
    Ack {
        /// Lease tag issued by a previous get
        tag: LeaseTag,
    },
    /// Show counts and the three-way breakdown
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leaseq".to_string(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let retries = if cli.unlimited {
        RetryPolicy::Unlimited
    } else {
        RetryPolicy::Limited(cli.tries)
    };
    let queue = Queue::open(
        &db,
        QueueOptions::new(&cli.queue)
            .ttl(Duration::from_secs(cli.ttl))
            .retries(retries)
            .insistent(cli.insistent)
            .strict(cli.strict),
    )
    .await?;

    match cli.command {
        Command::Add { items } => {
            let payloads: Vec<_> = items.into_iter().map(parse_payload).collect();
            for id in queue.add(payloads).await? {
                println!("{id}");
            }
        }
        Command::Get { lease } => {
            let task = match lease {
                Some(secs) => queue.get_for(Duration::from_secs(secs)).await?,
                None => queue.get().await?,
            };
            match task {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("no claimable task"),
            }
        }
        Command::Ping { tag, lease } => {
            let task = match lease {
                Some(secs) => queue.ping_for(tag, Duration::from_secs(secs)).await?,
                None => queue.ping(tag).await?,
            };
            match task {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("lease not held"),
            }
        }
        Command::Ack { tag } => match queue.ack(tag).await? {
            Some(id) => println!("{id}"),
            None => println!("lease not held"),
        },
        Command::Stats => {
            let total = queue.total().await?;
            let stats = queue.stats().await?;
            println!("total   {total}");
            println!("waiting {}", stats.waiting);
            println!("active  {}", stats.active);
            println!("failed  {}", stats.failed);
        }
    }

    Ok(())
}

/// Parse an item as JSON; fall back to treating it as a bare string.
fn parse_payload(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
}
