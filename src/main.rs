use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use repost_agent::agent::Agent;
use repost_agent::config;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show queue and archive counts
    Status,
    /// Fetch recent posts from one account into the queue
    Ingest {
        /// Account to fetch from
        #[arg(long)]
        author: String,
        /// How many recent posts to request
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Keep posts without media too
        #[arg(long)]
        include_text_only: bool,
    },
    /// Run the pipeline stages over every queued item
    Process,
    /// Publish one randomly chosen ready item
    Post {
        /// Block until posting conditions are satisfied
        #[arg(long)]
        wait: bool,
    },
    /// Full cycle: top up the queue, process, then publish several posts
    Cycle {
        /// Comma-separated accounts to fetch from
        #[arg(long, value_delimiter = ',', required = true)]
        authors: Vec<String>,
        /// Posts to request per account when topping up
        #[arg(long, default_value_t = 10)]
        per_account: usize,
        /// How many items to publish this cycle
        #[arg(long, default_value_t = 3)]
        posts: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let mut agent = Agent::from_config(&cfg).await?;

    match args.command {
        Command::Status => {
            println!("{}", agent.status());
        }
        Command::Ingest {
            author,
            count,
            include_text_only,
        } => {
            let added = agent
                .ingest_from_source(&author, count, !include_text_only)
                .await?;
            info!(added, "ingest finished");
        }
        Command::Process => {
            agent.process_all().await?;
        }
        Command::Post { wait } => {
            let published = agent.publish_one_random(wait).await?;
            if !published {
                info!("nothing was published");
            }
        }
        Command::Cycle {
            authors,
            per_account,
            posts,
        } => {
            agent.run_cycle(&authors, per_account, posts).await?;
        }
    }

    Ok(())
}
