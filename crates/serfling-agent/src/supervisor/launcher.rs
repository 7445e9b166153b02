//! Agent command construction.
//!
//! The supervisor only needs a [`Command`] that starts the agent with the
//! relay address wired into its event handler. [`SerfCommand`] builds the
//! real `serf agent` invocation; tests and embedders can pass any closure.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use serfling_core::config::AgentConfig;

/// Binary name of the event handler helper.
pub const EVENT_HANDLER_BIN: &str = "serfling-event-handler";

/// Builds the command that starts the supervised agent.
pub trait AgentLauncher: Send + Sync {
    /// Command for an agent whose event handler reports to `relay_addr`.
    fn command(&self, relay_addr: SocketAddr) -> std::io::Result<Command>;
}

impl<F> AgentLauncher for F
where
    F: Fn(SocketAddr) -> std::io::Result<Command> + Send + Sync,
{
    fn command(&self, relay_addr: SocketAddr) -> std::io::Result<Command> {
        self(relay_addr)
    }
}

/// `serf agent` command line built from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct SerfCommand {
    agent: AgentConfig,
    event_handler: PathBuf,
}

impl SerfCommand {
    pub const fn new(agent: AgentConfig, event_handler: PathBuf) -> Self {
        Self {
            agent,
            event_handler,
        }
    }

    pub fn event_handler(&self) -> &Path {
        &self.event_handler
    }

    /// Arguments following the `serf` binary.
    pub fn args(&self, relay_addr: SocketAddr) -> Vec<String> {
        let agent = &self.agent;
        let mut args = vec!["agent".to_string()];

        if let Some(node) = &agent.node {
            push_flag(&mut args, "-node", node);
        }
        if agent.replay {
            args.push("-replay".to_string());
        }
        if let Some(discover) = &agent.discover {
            push_flag(&mut args, "-discover", discover);
        }
        for (key, value) in &agent.tags {
            push_flag(&mut args, "-tag", format!("{key}={value}"));
        }

        push_flag(
            &mut args,
            "-event-handler",
            format!(
                "{} {} {}",
                self.event_handler.display(),
                relay_addr.ip(),
                relay_addr.port()
            ),
        );
        for handler in &agent.event_handlers {
            push_flag(&mut args, "-event-handler", handler);
        }

        let options: [(&str, Option<String>); 13] = [
            ("-bind", agent.bind.clone()),
            ("-iface", agent.iface.clone()),
            ("-advertise", agent.advertise.clone()),
            ("-config-file", path_option(agent.config_file.as_deref())),
            ("-config-dir", path_option(agent.config_dir.as_deref())),
            ("-encrypt", agent.encrypt.clone()),
            ("-join", agent.join.clone()),
            ("-log-level", Some(agent.log_level.clone())),
            ("-profile", agent.profile.clone()),
            ("-protocol", agent.protocol.map(|p| p.to_string())),
            ("-rpc-addr", Some(agent.rpc_addr.clone())),
            ("-snapshot", path_option(agent.snapshot.as_deref())),
            ("-tags-file", path_option(agent.tags_file.as_deref())),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                push_flag(&mut args, flag, value);
            }
        }

        args
    }
}

impl AgentLauncher for SerfCommand {
    fn command(&self, relay_addr: SocketAddr) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.agent.serf);
        cmd.args(self.args(relay_addr));

        match &self.agent.log_file {
            Some(path) => {
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(cmd)
    }
}

/// Helper installed next to the running executable, or looked up on `PATH`.
pub fn default_event_handler() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(EVENT_HANDLER_BIN)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(EVENT_HANDLER_BIN))
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

fn path_option(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.display().to_string())
}
