//! Command line client for the sand Timers and Workers API.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};

use sand::messages::from_unix_ms;
use sand::proto::{self, timers_client::TimersClient, workers_client::WorkersClient};

#[derive(Parser, Debug)]
#[command(name = "sandctl")]
#[command(about = "Manage delayed RPC timers on a sand server")]
#[command(version)]
struct Args {
    /// Sand server address
    #[arg(
        long,
        short = 'a',
        env = "SANDCTL_ADDR",
        default_value = "http://127.0.0.1:7710",
        global = true
    )]
    address: String,

    /// Output in JSON format instead of human-readable lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Schedule a delayed RPC
    Create {
        /// Timer name
        #[arg(long)]
        name: String,
        /// Key hashed to pick the shard (default: the name)
        #[arg(long, default_value = "")]
        shard_key: String,
        /// Label as key=value, repeatable
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,
        /// Seconds from now until the timer is due
        #[arg(long = "in", default_value = "0")]
        delay_secs: i64,
        #[arg(long, default_value = "0")]
        priority: i32,
        /// Target host:port
        #[arg(long)]
        target_addr: String,
        /// Authority override for the target
        #[arg(long, default_value = "")]
        authority: String,
        /// Full method path, e.g. /pkg.Service/Method
        #[arg(long)]
        method: String,
        /// Request metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
        /// Type URL of the request message
        #[arg(long)]
        args_type: String,
        /// File holding the encoded request message (default: empty message)
        #[arg(long)]
        args_file: Option<PathBuf>,
        /// Type URL of the response message
        #[arg(long)]
        return_type: String,
    },
    /// Show one timer
    Get { id: String },
    /// List timers
    List {
        /// Only the shard this key maps to
        #[arg(long)]
        shard_key: Option<String>,
        /// Selector as key=value, repeatable
        #[arg(long = "selector", short = 'l', value_parser = parse_key_value)]
        selector: Vec<(String, String)>,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Delete a timer by id, or every timer matching a selector
    Delete {
        #[arg(required_unless_present = "selector")]
        id: Option<String>,
        #[arg(long = "selector", short = 'l', value_parser = parse_key_value, conflicts_with = "id")]
        selector: Vec<(String, String)>,
    },
    /// List delivery workers and their last heartbeat
    Workers,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn format_ms(ms: i64) -> String {
    from_unix_ms(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|_| ms.to_string())
}

fn timer_json(timer: &proto::Timer) -> serde_json::Value {
    let target = timer.target.clone().unwrap_or_default();
    serde_json::json!({
        "id": timer.id,
        "name": timer.name,
        "shard_key": timer.shard_key,
        "shard_id": timer.shard_id,
        "labels": timer.labels,
        "created_at_unix_ms": timer.created_at_unix_ms,
        "due_at_unix_ms": timer.due_at_unix_ms,
        "due_counter": timer.due_counter,
        "priority": timer.priority,
        "assigned_worker": timer.assigned_worker,
        "assignable_at_unix_ms": timer.assignable_at_unix_ms,
        "attempt": timer.attempt,
        "retry_counter": timer.retry_counter,
        "target": {
            "addr": target.addr,
            "authority": target.authority,
            "method": target.method,
            "args_type_url": target.args_type_url,
            "return_type_url": target.return_type_url,
        },
        "delivered_at_unix_ms": timer.delivered_at_unix_ms,
        "delivered_status_code": timer.delivered_status_code,
        "delivered_err": timer.delivered_err,
    })
}

fn write_timer<W: Write>(out: &mut W, timer: &proto::Timer, json: bool) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string(&timer_json(timer))?)?;
        return Ok(());
    }
    let state = match (timer.delivered_at_unix_ms, &timer.delivered_err) {
        (Some(at), _) => format!("delivered {}", format_ms(at)),
        (None, Some(err)) => format!("failed ({err})"),
        (None, None) => "pending".to_string(),
    };
    let method = timer
        .target
        .as_ref()
        .map(|target| target.method.as_str())
        .unwrap_or_default();
    writeln!(
        out,
        "{}  {}  shard={}  due={}  attempt={}  {}  {}",
        timer.id,
        timer.name,
        timer.shard_id,
        format_ms(timer.due_at_unix_ms),
        timer.attempt,
        method,
        state
    )?;
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut out = io::stdout();
    let address = args.address.clone();

    match args.command {
        Command::Create {
            name,
            shard_key,
            labels,
            delay_secs,
            priority,
            target_addr,
            authority,
            method,
            meta,
            args_type,
            args_file,
            return_type,
        } => {
            let args_data = match args_file {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => Vec::new(),
            };
            let due_at = Utc::now() + chrono::Duration::seconds(delay_secs);
            let mut client = TimersClient::connect(address).await?;
            let timer = client
                .create_timer(proto::CreateTimerRequest {
                    name,
                    shard_key,
                    labels: labels.into_iter().collect(),
                    due_at_unix_ms: due_at.timestamp_millis(),
                    priority,
                    target: Some(proto::RpcTarget {
                        addr: target_addr,
                        authority,
                        method,
                        meta: meta.into_iter().collect(),
                        args_type_url: args_type,
                        args_data,
                        return_type_url: return_type,
                    }),
                })
                .await?
                .into_inner()
                .timer
                .ok_or_else(|| anyhow!("server returned no timer"))?;
            write_timer(&mut out, &timer, args.json)
        }
        Command::Get { id } => {
            let mut client = TimersClient::connect(address).await?;
            let timer = client
                .get_timer(proto::GetTimerRequest { id })
                .await?
                .into_inner()
                .timer
                .ok_or_else(|| anyhow!("server returned no timer"))?;
            write_timer(&mut out, &timer, args.json)
        }
        Command::List {
            shard_key,
            selector,
            limit,
        } => {
            let mut client = TimersClient::connect(address).await?;
            let timers = client
                .list_timers(proto::ListTimersRequest {
                    shard_key,
                    selector: selector.into_iter().collect::<HashMap<_, _>>(),
                    limit,
                })
                .await?
                .into_inner()
                .timers;
            for timer in &timers {
                write_timer(&mut out, timer, args.json)?;
            }
            Ok(())
        }
        Command::Delete { id, selector } => {
            let mut client = TimersClient::connect(address).await?;
            let deleted = match id {
                Some(id) => u64::from(
                    client
                        .delete_timer(proto::DeleteTimerRequest { id })
                        .await?
                        .into_inner()
                        .deleted,
                ),
                None => {
                    client
                        .delete_timers(proto::DeleteTimersRequest {
                            selector: selector.into_iter().collect(),
                        })
                        .await?
                        .into_inner()
                        .deleted
                }
            };
            if args.json {
                writeln!(out, "{}", serde_json::json!({ "deleted": deleted }))?;
            } else {
                writeln!(out, "deleted {deleted} timer(s)")?;
            }
            Ok(())
        }
        Command::Workers => {
            let mut client = WorkersClient::connect(address).await?;
            let workers = client
                .list_workers(proto::ListWorkersRequest {})
                .await?
                .into_inner()
                .workers;
            for worker in workers {
                if args.json {
                    let line = serde_json::json!({
                        "identity": worker.identity,
                        "started_at_unix_ms": worker.started_at_unix_ms,
                        "last_seen_at_unix_ms": worker.last_seen_at_unix_ms,
                    });
                    writeln!(out, "{line}")?;
                } else {
                    writeln!(
                        out,
                        "{}  started={}  last_seen={}",
                        worker.identity,
                        format_ms(worker.started_at_unix_ms),
                        format_ms(worker.last_seen_at_unix_ms)
                    )?;
                }
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
