//! conflux - command-line consumer and producer
//!
//! Connection settings come from the environment (`KAFKA_BOOTSTRAP_SERVERS`,
//! `KAFKA_GROUP_ID`, `KAFKA_SECURITY_PROTOCOL`, ...), the same keys an embedding
//! application reads.
//!
//! # Usage
//!
//! ```bash
//! # Print records of two topics, replaying one from the beginning
//! conflux consume --topic orders:earliest --topic '#AUDIT_TOPIC'
//!
//! # Publish a JSON record
//! conflux produce --topic orders --key o-1 --json --value '{"id":1}'
//!
//! # Show the effective settings with secrets redacted
//! conflux config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conflux::config::{EnvResolver, KafkaSettings};
use conflux::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "conflux")]
#[command(version, about = "Consume and produce through the conflux broker runtime")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume topics and print each record as a JSON line
    Consume {
        /// Topic to consume, `name[:seek]`; `#KEY` reads the name from the environment.
        /// Seek is one of earliest, latest or an absolute offset.
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,

        /// Commit each record after printing it instead of auto-committing
        #[arg(long)]
        manual_commit: bool,
    },
    /// Publish one record
    Produce {
        #[arg(short, long)]
        topic: String,

        #[arg(long)]
        value: String,

        #[arg(short, long)]
        key: Option<String>,

        /// Parse the value as JSON instead of sending raw text
        #[arg(long)]
        json: bool,

        /// Explicit partition
        #[arg(short, long)]
        partition: Option<i32>,
    },
    /// Print the effective settings (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = KafkaSettings::from_env().context("Invalid broker settings")?;
    settings.enabled = true;
    settings.startup_delay = Duration::ZERO;

    match cli.command {
        Commands::Consume {
            topics,
            manual_commit,
        } => consume(settings, topics, manual_commit).await,
        Commands::Produce {
            topic,
            value,
            key,
            json,
            partition,
        } => produce(settings, &topic, value, key, json, partition).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the records
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Split `name[:seek]`; a suffix that is not a seek policy stays part of the name
fn parse_topic_arg(arg: &str) -> (&str, SeekPolicy) {
    match arg.rsplit_once(':') {
        Some((name, seek)) => match seek.parse::<SeekPolicy>() {
            Ok(policy) => (name, policy),
            Err(_) => (arg, SeekPolicy::None),
        },
        None => (arg, SeekPolicy::None),
    }
}

fn record_line(envelope: &Envelope) -> Value {
    json!({
        "topic": envelope.topic,
        "partition": envelope.partition,
        "offset": envelope.offset,
        "timestamp": envelope.timestamp,
        "key": envelope.key,
        "value": envelope.value,
    })
}

async fn consume(mut settings: KafkaSettings, topics: Vec<String>, manual_commit: bool) -> Result<()> {
    if manual_commit {
        settings.auto_commit.enabled = false;
    }

    let mut registry = TopicRegistry::new();
    for arg in &topics {
        let (token, seek) = parse_topic_arg(arg);
        registry.add_fn(
            token,
            |envelope: Envelope, mut ctx: DispatchContext| async move {
                println!("{}", record_line(&envelope));
                if let Some(commit) = ctx.commit.take() {
                    commit.commit().await?;
                }
                Ok::<_, anyhow::Error>(())
            },
            seek,
        );
    }
    let registry = registry.resolve(&EnvResolver)?;

    let driver = KafkaDriver::new(&settings)?;
    let runtime = BrokerRuntime::builder(settings, driver)
        .registry(registry)
        .build();
    runtime.start().await?;

    let mut states = runtime.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C)");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match state {
                    ConnectionState::Connected => info!(generation = runtime.generation(), "Consuming"),
                    ConnectionState::Restarting => warn!(restarts = runtime.restart_count(), "Reconnecting"),
                    _ => {}
                }
            }
        }
    }

    runtime.disconnect().await;
    Ok(())
}

async fn produce(
    settings: KafkaSettings,
    topic: &str,
    value: String,
    key: Option<String>,
    json: bool,
    partition: Option<i32>,
) -> Result<()> {
    let mut message = if json {
        let value: Value = serde_json::from_str(&value).context("--value is not valid JSON")?;
        OutboundMessage::new(value)
    } else {
        OutboundMessage::text(value)
    };
    if let Some(key) = key {
        message = message.with_key(key);
    }
    if let Some(partition) = partition {
        message = message.with_partition(partition);
    }

    let driver = KafkaDriver::new(&settings)?;
    let runtime = BrokerRuntime::builder(settings, driver).build();
    runtime.connect().await?;

    let result = runtime.send(topic, message).await;
    runtime.disconnect().await;

    for metadata in result? {
        println!(
            "{}",
            json!({
                "topic": metadata.topic,
                "partition": metadata.partition,
                "offset": metadata.offset,
            })
        );
    }
    Ok(())
}
