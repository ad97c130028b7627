//! workq CLI: operator interface to a durable queue.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workq::config::Config;
use workq::engine::Queue;
use workq::model::{Message, MessageId, Receipt};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Durable single-file work queue")]
struct Cli {
    /// Queue name
    #[arg(long, short, default_value = "default")]
    queue: String,
    /// TOML config file (otherwise WORKQ_* environment variables)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a JSON payload
    Submit {
        /// Payload as JSON
        payload: String,
    },
    /// Reserve the oldest ready message
    Reserve {
        /// Seconds to wait for a message (default: queue default)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Reserve and delete the oldest ready message
    Take {
        /// Seconds to wait for a message (default: queue default)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Acknowledge a reserved message
    Finish(Settle),
    /// Return a reserved message to the queue
    Release(Settle),
    /// Bury a reserved message
    Abort(Settle),
    /// Show ready messages without claiming them
    Peek {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Count ready messages
    Count,
    /// Show aborted messages
    Buried {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Destroy the queue store and every message in it
    Flush {
        /// Required: confirms the store may be deleted
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args)]
struct Settle {
    id: MessageId,
    /// Only act if the reservation still carries this lease (from `reserve`)
    #[arg(long)]
    lease: Option<u32>,
}

impl From<Settle> for Receipt {
    fn from(settle: Settle) -> Self {
        Receipt {
            id: settle.id,
            lease: settle.lease,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let queue = Queue::open(config.queue(&cli.queue)?).await?;

    match cli.command {
        Command::Submit { payload } => cmd_submit(&queue, &payload).await?,
        Command::Reserve { timeout } => {
            let message = queue.reserve(timeout.map(Duration::from_secs)).await?;
            print_claimed(message)?;
        }
        Command::Take { timeout } => {
            let message = queue.take(timeout.map(Duration::from_secs)).await?;
            print_claimed(message)?;
        }
        Command::Finish(settle) => {
            let id = settle.id;
            report(queue.finish(settle).await?, id, "finished");
        }
        Command::Release(settle) => {
            let id = settle.id;
            report(queue.release(settle).await?, id, "released");
        }
        Command::Abort(settle) => {
            let id = settle.id;
            report(queue.abort(settle).await?, id, "buried");
        }
        Command::Peek { limit } => cmd_peek(&queue, limit).await?,
        Command::Count => println!("{}", queue.count().await?),
        Command::Buried { limit } => cmd_buried(&queue, limit).await?,
        Command::Flush { yes } => {
            if !yes {
                anyhow::bail!("refusing to flush queue '{}' without --yes", cli.queue);
            }
            queue.flush().await?;
            println!("Flushed: {}", cli.queue);
            return Ok(());
        }
    }

    queue.close().await;
    Ok(())
}

async fn cmd_submit(queue: &Queue, payload: &str) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    match queue.submit(&payload).await? {
        Some(id) => println!("{id}"),
        None => anyhow::bail!("submit did not take effect"),
    }
    Ok(())
}

async fn cmd_peek(queue: &Queue, limit: usize) -> anyhow::Result<()> {
    let messages = queue.peek(limit).await?;
    if messages.is_empty() {
        println!("No ready messages.");
        return Ok(());
    }

    println!("{:<10}  {:<8}  PAYLOAD", "ID", "FAILURES");
    println!("{}", "-".repeat(60));
    for message in &messages {
        println!(
            "{:<10}  {:<8}  {}",
            message.id,
            message.failures,
            serde_json::to_string(&message.payload)?
        );
    }
    println!("\n{} message(s)", messages.len());
    Ok(())
}

async fn cmd_buried(queue: &Queue, limit: usize) -> anyhow::Result<()> {
    let buried = queue.buried(limit).await?;
    if buried.is_empty() {
        println!("No buried messages.");
        return Ok(());
    }

    println!("{:<10}  {:<8}  {:<20}  PAYLOAD", "ID", "FAILURES", "BURIED");
    println!("{}", "-".repeat(80));
    for message in &buried {
        println!(
            "{:<10}  {:<8}  {:<20}  {}",
            message.id,
            message.failures,
            message.buried_at.format("%Y-%m-%d %H:%M:%S"),
            serde_json::to_string(&message.payload)?
        );
        if let Some(reason) = &message.reason {
            println!("{:<10}  {reason}", "");
        }
    }
    Ok(())
}

fn print_claimed(message: Option<Message>) -> anyhow::Result<()> {
    match message {
        Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
        None => println!("No message available."),
    }
    Ok(())
}

fn report(changed: bool, id: MessageId, verb: &str) {
    if changed {
        println!("{verb}: {id}");
    } else {
        println!("{id} is not reserved (or its lease moved on); nothing to do");
    }
}
