#![forbid(unsafe_code)]

//! `agent-rpc-ctl`: drive an agent from the command line.
//!
//! Starts a client from a TOML configuration (or connects to an existing TCP
//! or local socket server), issues one call, prints the JSON result on
//! stdout and shuts the agent down.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use agent_rpc::telemetry::{init_tracing, LogFormat};
use agent_rpc::{ClientConfig, ConnectionState, Result, RpcClient, RpcError};

#[derive(Debug, Parser)]
#[command(
    name = "agent-rpc-ctl",
    about = "Call JSON-RPC methods on an agent process",
    version,
    long_about = None
)]
#[command(group(ArgGroup::new("target").required(true).args(["config", "url", "socket"])))]
struct Cli {
    /// Path to a client TOML configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect to an external TCP server (`port`, `host:port` or `http://host:port`).
    #[arg(long)]
    url: Option<String>,

    /// Connect to a local socket server by path or name.
    #[arg(long)]
    socket: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a request and print its result.
    Call {
        /// Method name.
        method: String,
        /// JSON parameters.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Give up after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send a notification.
    Notify {
        /// Method name.
        method: String,
        /// JSON parameters.
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Print notifications as JSON lines.
    Watch {
        /// Only print notifications for this method.
        #[arg(long)]
        method: Option<String>,
        /// Stop after this many seconds; 0 waits for Ctrl-C.
        #[arg(long, default_value_t = 0)]
        seconds: u64,
    },

    /// Send `ping` and print the reply.
    Ping {
        /// Message echoed by the agent.
        #[arg(default_value = "hello")]
        message: String,
    },
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        match (&self.config, &self.url, &self.socket) {
            (Some(path), _, _) => ClientConfig::load_from_path(path),
            (None, Some(url), _) => Ok(ClientConfig::tcp(url.clone())),
            (None, None, Some(name)) => Ok(ClientConfig::local_socket(name.clone())),
            (None, None, None) => Err(RpcError::Config(
                "one of --config, --url or --socket is required".into(),
            )),
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format, "warn")?;

    let config = args.client_config()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| RpcError::Io(format!("failed to build runtime: {err}")))?
        .block_on(run(config, args.command))
}

async fn run(config: ClientConfig, command: Command) -> Result<()> {
    let client = RpcClient::new(config)?;
    client.start().await?;
    info!(client_id = client.client_id(), "connected");

    let outcome = execute(&client, command).await;

    if let Err(err) = client.stop().await {
        eprintln!("warning: {err}");
    }
    outcome
}

async fn execute(client: &RpcClient, command: Command) -> Result<()> {
    match command {
        Command::Call {
            method,
            params,
            timeout_ms,
        } => {
            let params = parse_params(&params)?;
            let result = match timeout_ms {
                Some(ms) => {
                    client
                        .request_with_timeout(&method, params, Some(Duration::from_millis(ms)))
                        .await?
                }
                None => client.request(&method, params).await?,
            };
            print_json(&result)
        }

        Command::Notify { method, params } => {
            client.notify(&method, parse_params(&params)?).await?;
            println!("OK");
            Ok(())
        }

        Command::Ping { message } => {
            let result = client.ping(&message).await?;
            print_json(&result)
        }

        Command::Watch { method, seconds } => watch(client, method, seconds).await,
    }
}

async fn watch(client: &RpcClient, method: Option<String>, seconds: u64) -> Result<()> {
    let print = |event: &agent_rpc::Notification| {
        let line = serde_json::json!({ "method": event.method, "params": event.params });
        println!("{line}");
    };
    let _subscription = match method {
        Some(method) => client.subscribe_method(method, print)?,
        None => client.subscribe(print)?,
    };

    let mut states = client.state_changes();
    let deadline = async {
        if seconds == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
    };

    tokio::select! {
        () = deadline => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| RpcError::Io(format!("failed to listen for ctrl-c: {err}")))
        }
        _ = states.wait_for(|s| *s == ConnectionState::Failed) => Err(RpcError::Transport(
            client.last_error().unwrap_or_else(|| "connection lost".into()),
        )),
    }
}

fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| RpcError::Config(format!("invalid --params JSON: {err}")))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
