//! serfling
//!
//! Runs a supervised serf agent with its event relay, or drives a running
//! agent through the serf CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use serfling_agent::Supervisor;
use serfling_agent::client::SerfClient;
use serfling_core::Config;
use serfling_core::config::load_config;

mod commands;

use commands::ClientCommand;

#[derive(Parser, Debug)]
#[command(name = "serfling")]
#[command(version, about = "Serf agent supervisor and event relay")]
struct Cli {
    /// Config file (JSON), layered over the global settings file
    #[arg(long, global = true, env = "SERFLING_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the `serf` binary
    #[arg(long, global = true)]
    serf: Option<PathBuf>,

    /// Serf RPC address
    #[arg(long, global = true)]
    rpc_addr: Option<String>,

    /// Log filter for serfling itself (e.g. "info", "debug")
    #[arg(long, global = true, default_value = "info", env = "SERFLING_LOG")]
    log: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "SERFLING_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a serf agent under supervision and log its events
    Agent(AgentArgs),
    #[command(flatten)]
    Client(ClientCommand),
}

#[derive(clap::Args, Debug)]
struct AgentArgs {
    /// Node name
    #[arg(long)]
    node: Option<String>,

    /// Address to bind the gossip listener to
    #[arg(long)]
    bind: Option<String>,

    /// Address of an existing member to join on startup
    #[arg(long)]
    join: Option<String>,

    /// Initial tag (repeatable)
    #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    tags: Vec<(String, String)>,

    /// Path to the serfling-event-handler helper
    #[arg(long)]
    event_handler: Option<PathBuf>,

    /// Dispatch membership and user events concurrently
    #[arg(long)]
    parallel_events: bool,

    /// Answer queries on the accept loop instead of a task per query
    #[arg(long)]
    sync_query: bool,

    /// Stop the relay after the first failing hook or responder
    #[arg(long)]
    propagate_errors: bool,

    /// Seconds to wait after SIGINT before killing the agent
    #[arg(long)]
    stop_timeout: Option<u64>,

    /// Fail if the agent has not delivered an event within this many seconds
    #[arg(long)]
    ready_timeout: Option<u64>,

    /// Reply to queries named NAME with TEXT (repeatable)
    #[arg(long = "respond", value_name = "NAME=TEXT", value_parser = parse_key_value)]
    responders: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("serfling={0},serfling_agent={0},serfling_core={0}", cli.log);
    serfling_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(serf) = cli.serf {
        config.agent.serf = serf;
    }
    if let Some(rpc_addr) = cli.rpc_addr {
        config.agent.rpc_addr = rpc_addr;
    }

    match cli.command {
        Commands::Agent(args) => run_agent(config, args).await,
        Commands::Client(command) => {
            let client = SerfClient::from_config(&config.agent);
            commands::run(&client, command).await
        }
    }
}

fn apply_agent_args(config: &mut Config, args: &AgentArgs) {
    if args.node.is_some() {
        config.agent.node.clone_from(&args.node);
    }
    if args.bind.is_some() {
        config.agent.bind.clone_from(&args.bind);
    }
    if args.join.is_some() {
        config.agent.join.clone_from(&args.join);
    }
    config.agent.tags.extend(args.tags.iter().cloned());
    if args.event_handler.is_some() {
        config.supervisor.event_handler.clone_from(&args.event_handler);
    }
    if args.parallel_events {
        config.relay.parallel_events = true;
    }
    if args.sync_query {
        config.relay.async_query = false;
    }
    if args.propagate_errors {
        config.relay.propagate_handler_errors = true;
    }
    if let Some(secs) = args.stop_timeout {
        config.supervisor.stop_timeout_secs = secs;
    }
}

async fn run_agent(mut config: Config, args: AgentArgs) -> anyhow::Result<()> {
    apply_agent_args(&mut config, &args);

    let supervisor = Supervisor::from_config(&config);
    supervisor.on_event(|event| {
        info!(
            kind = %event.kind(),
            self_name = event.self_name().unwrap_or_default(),
            members = event.members().map_or(0, <[_]>::len),
            user_event = event.user_event_name().unwrap_or_default(),
            query = event.query_name().unwrap_or_default(),
            ltime = event.logical_time().unwrap_or_default(),
            payload_bytes = event.payload().len(),
            "Serf event"
        );
        Ok(())
    });
    supervisor.on_stop(|status| {
        match status {
            Some(status) => warn!(%status, "Agent exited"),
            None => info!("Agent stopping"),
        }
        Ok(())
    });
    for (name, text) in args.responders {
        supervisor.respond(&name, true, move |_| Ok(text.clone()))?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        serf = %config.agent.serf.display(),
        node = ?config.agent.node,
        rpc_addr = %config.agent.rpc_addr,
        "Starting serfling agent"
    );
    let pid = supervisor.start().await?;
    info!(pid, relay = ?supervisor.relay_addr(), "Agent running");

    if let Some(secs) = args.ready_timeout {
        if let Err(e) = supervisor.wait_for_ready(Duration::from_secs(secs)).await {
            error!(error = %e, "Agent did not become ready");
            if supervisor.running() {
                supervisor.stop().await?;
            }
            return Err(e.into());
        }
        info!("Agent ready");
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
        () = wait_for_exit(&supervisor) => {}
    }

    if supervisor.dead() {
        anyhow::bail!(
            "serf agent exited unexpectedly ({:?})",
            supervisor.exit_status()
        );
    }

    let status = supervisor.stop().await?;
    info!(?status, "serfling stopped");
    Ok(())
}

async fn wait_for_exit(supervisor: &Supervisor) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if supervisor.dead() {
            return;
        }
    }
}
