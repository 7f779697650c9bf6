// Petriflow - admin tooling
// Inspects broker state through the RabbitMQ management API
// Run with: cargo run --bin admin -- queue-show '.*' messages consumers

//! # Admin Binary
//!
//! Operational queries against a running deployment: vhost status, queue
//! properties, and peeking at queued messages. Everything goes through the
//! management plugin's HTTP API, so it works without an AMQP channel and
//! without disturbing consumers (unless `--no-requeue` is asked for).

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use petriflow::{ManagementApi, Settings};

#[derive(Parser, Debug)]
#[command(name = "admin", about = "Petriflow broker administration")]
struct Args {
    /// Path to a settings file (TOML/YAML/JSON)
    #[arg(short, long, env = "PETRIFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the status of the configured vhost
    VhostStatus,

    /// Tabulate queue properties for queues matching a pattern
    QueueShow {
        /// Regular expression over queue names
        pattern: String,
        /// Properties to show; empty shows the full records
        properties: Vec<String>,
    },

    /// Pull messages off queues matching a pattern
    QueueGet {
        /// Regular expression over queue names
        pattern: String,
        /// Maximum number of messages to pull in total
        #[arg(short, long, default_value_t = 1)]
        count: u64,
        /// Leave the messages on the queue
        #[arg(long, default_value_t = true)]
        requeue: bool,
        /// Show full delivery records instead of just payloads
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("admin failed: {}", e);
            1
        }
    });
}

async fn run() -> petriflow::Result<()> {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    let api = ManagementApi::new(
        &settings.amqp.url,
        settings.amqp.api_port,
        settings.amqp.vhost.clone(),
        settings.bindings.clone(),
    )?;

    match args.command {
        Command::VhostStatus => {
            let status = api.vhost_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::QueueShow {
            pattern,
            properties,
        } => {
            if properties.is_empty() {
                let records = api.queue_show_all(&pattern).await?;
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for row in api.queue_show(&pattern, &properties).await? {
                    println!("{}", row.join("\t"));
                }
            }
        }

        Command::QueueGet {
            pattern,
            count,
            requeue,
            full,
        } => {
            let contents = api.queue_get(&pattern, count, requeue, full).await?;
            println!("{}", serde_json::to_string_pretty(&contents)?);
        }
    }

    Ok(())
}
