//! Command-line front end for the summoner orchestration fabric.
//!
//! Exit codes: 0 on success, 1 on failure, 130 when interrupted.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::process::ExitCode;
use summoner_fabric::{
    Dispatcher, SessionManager, StoreClient, StoreConfig, Worker, default_prefix_from_env,
    parse_message,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "summoner", version, about = "Multi-agent orchestration over a Redis-compatible store")]
struct Cli {
    /// Store host (overrides REDIS_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Store port (overrides REDIS_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// `<project>-<host>-NNN` prefix with per-slot report lists
    Sequenced,
    /// `summoner:<uuid>` prefix with a shared report list and monitor channel
    Uuid,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session and print its descriptor
    Init {
        #[arg(long, value_enum, default_value_t = Mode::Uuid)]
        mode: Mode,
        #[arg(long, default_value_t = 9)]
        max_children: u32,
        /// Descriptor TTL in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
        /// Base prefix for sequenced mode (default: PROJECT_NAME-HOSTNAME)
        #[arg(long)]
        prefix: Option<String>,
        /// Explicit session id for uuid mode
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Print a session descriptor
    Get {
        /// Session id (uuid mode) or full prefix (sequenced mode)
        session: String,
    },
    /// Delete a session and all its keys
    Cleanup {
        /// Session id (uuid mode) or full prefix (sequenced mode)
        session: String,
    },
    /// Push raw messages onto a list
    Rpush {
        queue: String,
        #[arg(required = true)]
        messages: Vec<String>,
        /// Also mirror each push to this pub/sub channel
        #[arg(long)]
        channel: Option<String>,
    },
    /// Blocking-pop from one or more lists
    Blpop {
        #[arg(required = true)]
        queues: Vec<String>,
        /// Per-receive timeout in seconds (0 waits forever)
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        /// Number of messages to receive
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Keep receiving until interrupted or a receive times out
        #[arg(long)]
        continuous: bool,
        /// Decode each message and report its type
        #[arg(long)]
        parse: bool,
    },
    /// Drive the parent dispatcher: fan tasks out, collect reports, shut down
    Dispatch {
        #[arg(long)]
        session_id: String,
        /// One prompt per worker slot
        #[arg(long, required = true, num_args = 1..)]
        tasks: Vec<String>,
        /// Overall report-collection budget in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Skip waiting for reports
        #[arg(long)]
        no_wait: bool,
        /// Skip the final broadcast shutdown
        #[arg(long)]
        no_shutdown: bool,
    },
    /// Run a worker loop for one slot
    Work {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        child_id: u32,
        /// Stop after this many tasks
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Per-receive timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn store_config(cli: &Cli) -> StoreConfig {
    let mut config = StoreConfig::from_env();
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = store_config(&cli);

    tokio::select! {
        result = run(cli.command, config) => match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::from(1)
            },
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::from(130)
        },
    }
}

async fn run(command: Command, config: StoreConfig) -> Result<ExitCode> {
    match command {
        Command::Init {
            mode,
            max_children,
            ttl,
            prefix,
            session_id,
        } => {
            let mut manager = SessionManager::new(config);
            let descriptor = match mode {
                Mode::Uuid => manager.create_summoner(max_children, ttl, session_id).await?,
                Mode::Sequenced => {
                    let base = prefix.unwrap_or_else(default_prefix_from_env);
                    manager.create_sequenced_prefixed(&base, max_children, ttl).await?
                },
            };
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(ExitCode::SUCCESS)
        },

        Command::Get { session } => {
            let mut manager = SessionManager::new(config);
            let descriptor = match manager.load(&session).await? {
                Some(descriptor) => Some(descriptor),
                None => manager.load_prefix(&session).await?,
            };
            match descriptor {
                Some(descriptor) => {
                    println!("{}", serde_json::to_string_pretty(&descriptor)?);
                    Ok(ExitCode::SUCCESS)
                },
                None => {
                    eprintln!("session not found: {session}");
                    Ok(ExitCode::from(1))
                },
            }
        },

        Command::Cleanup { session } => {
            let mut manager = SessionManager::new(config);
            let cleaned = match manager.cleanup_session_id(&session).await? {
                true => true,
                false => manager.cleanup_prefix(&session).await?,
            };
            if cleaned {
                println!("session cleaned up: {session}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("session not found: {session}");
                Ok(ExitCode::from(1))
            }
        },

        Command::Rpush {
            queue,
            messages,
            channel,
        } => {
            let mut client = StoreClient::new(config);
            let refs: Vec<&str> = messages.iter().map(String::as_str).collect();
            let length = client.rpush(&queue, &refs).await?;
            if let Some(channel) = channel {
                for message in &messages {
                    let envelope = summoner_fabric::MonitorEnvelope::wrap(&queue, message);
                    client.publish(&channel, &envelope.to_json()?).await?;
                }
            }
            println!(
                "{}",
                json!({"queue": queue, "pushed": messages.len(), "list_length": length})
            );
            Ok(ExitCode::SUCCESS)
        },

        Command::Blpop {
            queues,
            timeout,
            count,
            continuous,
            parse,
        } => {
            let mut client = StoreClient::new(config);
            let refs: Vec<&str> = queues.iter().map(String::as_str).collect();
            let mut index = 0u32;
            loop {
                if !continuous && index >= count {
                    break;
                }
                let Some((list, value)) = client.blpop(&refs, timeout).await? else {
                    info!("receive timed out");
                    break;
                };
                index += 1;
                let parsed_type = parse
                    .then(|| parse_message(&value).map(|m| m.message_type().to_string()).ok())
                    .flatten();
                let mut line = json!({
                    "index": index,
                    "list": list,
                    "message": value,
                    "timestamp": summoner_fabric::messages::now_timestamp(),
                });
                if let Some(parsed_type) = parsed_type {
                    line["parsed_type"] = json!(parsed_type);
                }
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        },

        Command::Dispatch {
            session_id,
            tasks,
            timeout,
            no_wait,
            no_shutdown,
        } => {
            let mut dispatcher = Dispatcher::connect(config, &session_id).await?;
            let outcomes = dispatcher.send_tasks_to_all(&tasks).await?;
            let sent = outcomes.iter().filter(|o| o.ok).count();

            let reports = if no_wait || sent == 0 {
                Vec::new()
            } else {
                dispatcher.receive_all_reports(sent, timeout).await?
            };

            let shutdown_sent = if no_shutdown {
                false
            } else {
                let acks = dispatcher.send_shutdown("normal", true, None).await?;
                acks.iter().any(|ok| *ok)
            };

            let successful = reports.iter().filter(|r| r.status.is_success()).count();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "session_id": session_id,
                    "tasks_sent": sent,
                    "dispatches": outcomes,
                    "reports_received": reports.len(),
                    "successful_reports": successful,
                    "failed_reports": reports.len() - successful,
                    "shutdown_sent": shutdown_sent,
                }))?
            );
            Ok(ExitCode::SUCCESS)
        },

        Command::Work {
            session_id,
            child_id,
            max_tasks,
            timeout,
        } => {
            let mut worker = Worker::with_default_handler(config, session_id, child_id);
            let outcome = worker.run(max_tasks, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        },
    }
}
