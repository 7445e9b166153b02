//! Thin wrapper over the `serf` command line.
//!
//! Every call runs `serf <command> -rpc-addr=<addr> ...` against a running
//! agent and parses JSON output where the command offers it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use serfling_core::config::AgentConfig;

// Constant patterns; a typo is caught by `classification_patterns_compile`.
#[allow(clippy::expect_used)]
static CONNECTION_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Error connecting to Serf agent:").expect("hardcoded regex")
});
#[allow(clippy::expect_used)]
static LENGTH_EXCEEDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)exceeds limit of \d+ bytes$").expect("hardcoded regex"));
#[allow(clippy::expect_used)]
static UNKNOWN_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Available commands are:").expect("hardcoded regex"));

/// Errors from `serf` invocations.
#[derive(Debug, thiserror::Error)]
pub enum SerfError {
    #[error("Failed to run {}: {source}", serf.display())]
    Spawn {
        serf: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    LengthExceedsLimit(String),

    #[error("serf does not know this command: {0}")]
    CommandNotFound(String),

    #[error("serf v0.6.0 or later is required to run `serf info`")]
    InsufficientVersion,

    #[error("{0}")]
    Command(String),

    #[error("Invalid serf output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Member not found: {0}")]
    MemberNotFound(String),
}

impl SerfError {
    /// Classify the combined output of a failed `serf` run.
    pub fn from_output(output: &str) -> Self {
        let message = output.trim_end().to_string();
        if CONNECTION_FAILED.is_match(&message) {
            Self::Connection(message)
        } else if LENGTH_EXCEEDED.is_match(&message) {
            Self::LengthExceedsLimit(message)
        } else if UNKNOWN_COMMAND.is_match(&message) {
            Self::CommandNotFound(message)
        } else {
            Self::Command(message)
        }
    }
}

/// One entry of `serf members -format json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: String,
    #[serde(default)]
    pub protocol: BTreeMap<String, i64>,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<MemberInfo>,
}

/// Filters for `serf members`.
#[derive(Debug, Clone, Default)]
pub struct MemberFilter {
    /// `alive`, `failed`, `left`, ...
    pub status: Option<String>,
    /// Name pattern (serf treats it as a regular expression).
    pub name: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Options for `serf query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub nodes: Vec<String>,
    /// `key=value` tag filters.
    pub tags: Vec<String>,
    pub timeout: Option<Duration>,
    pub no_ack: bool,
}

/// Client for a running serf agent.
#[derive(Debug, Clone)]
pub struct SerfClient {
    serf: PathBuf,
    rpc_addr: String,
    name: Option<String>,
}

impl SerfClient {
    pub fn new(rpc_addr: impl Into<String>) -> Self {
        Self {
            serf: PathBuf::from("serf"),
            rpc_addr: rpc_addr.into(),
            name: None,
        }
    }

    /// Client talking to the agent `config` describes.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            serf: config.serf.clone(),
            rpc_addr: config.rpc_addr.clone(),
            name: config.node.clone(),
        }
    }

    #[must_use]
    pub fn with_serf(mut self, serf: impl Into<PathBuf>) -> Self {
        self.serf = serf.into();
        self
    }

    /// Node name used by the tag operations.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn serf(&self) -> &Path {
        &self.serf
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `serf info`.
    pub async fn info(&self) -> Result<serde_json::Value, SerfError> {
        match self.call("info", &["-format", "json"]).await {
            Ok(out) => Ok(serde_json::from_str(&out)?),
            Err(SerfError::CommandNotFound(_)) => Err(SerfError::InsufficientVersion),
            Err(e) => Err(e),
        }
    }

    /// Broadcast a user event.
    pub async fn event(&self, name: &str, payload: &str, coalesce: bool) -> Result<(), SerfError> {
        let mut args = Vec::new();
        if !coalesce {
            args.push("-coalesce=false");
        }
        args.extend([name, payload]);
        self.call("event", &args).await.map(drop)
    }

    /// Send a query and return the parsed acks and responses.
    pub async fn query(
        &self,
        name: &str,
        payload: &str,
        options: &QueryOptions,
    ) -> Result<serde_json::Value, SerfError> {
        let mut args = vec!["-format".to_string(), "json".to_string()];
        args.extend(options.nodes.iter().map(|node| format!("-node={node}")));
        args.extend(options.tags.iter().map(|tag| format!("-tag={tag}")));
        if let Some(timeout) = options.timeout {
            args.push(format!("-timeout={}ms", timeout.as_millis()));
        }
        if options.no_ack {
            args.push("-no-ack".to_string());
        }
        args.push(name.to_string());
        args.push(payload.to_string());

        let out = self.call("query", &args).await?;
        Ok(serde_json::from_str(&out)?)
    }

    pub async fn join(&self, addr: &str, replay: bool) -> Result<(), SerfError> {
        let mut args = Vec::new();
        if replay {
            args.push("-replay");
        }
        args.push(addr);
        self.call("join", &args).await.map(drop)
    }

    pub async fn leave(&self) -> Result<(), SerfError> {
        self.call::<&str>("leave", &[]).await.map(drop)
    }

    pub async fn force_leave(&self, node: &str) -> Result<(), SerfError> {
        self.call("force-leave", &[node]).await.map(drop)
    }

    pub async fn members(&self, filter: &MemberFilter) -> Result<Vec<MemberInfo>, SerfError> {
        let mut args = vec!["-format".to_string(), "json".to_string()];
        if let Some(status) = &filter.status {
            args.extend(["-status".to_string(), status.clone()]);
        }
        if let Some(name) = &filter.name {
            args.extend(["-name".to_string(), name.clone()]);
        }
        for (key, value) in &filter.tags {
            args.extend(["-tag".to_string(), format!("{key}={value}")]);
        }

        let out = self.call("members", &args).await?;
        let response: MembersResponse = serde_json::from_str(&out)?;
        Ok(response.members)
    }

    /// Tags of the local node.
    ///
    /// The node is the configured name, or the agent's own name from
    /// `serf info` when none was given.
    pub async fn get_tags(&self) -> Result<BTreeMap<String, String>, SerfError> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => self.agent_name().await?,
        };
        let filter = MemberFilter {
            name: Some(format!("^{}$", regex::escape(&name))),
            ..MemberFilter::default()
        };
        self.members(&filter)
            .await?
            .into_iter()
            .find(|member| member.name == name)
            .map(|member| member.tags)
            .ok_or(SerfError::MemberNotFound(name))
    }

    pub async fn set_tag(&self, key: &str, value: &str) -> Result<(), SerfError> {
        self.call("tags", &["-set".to_string(), format!("{key}={value}")])
            .await
            .map(drop)
    }

    pub async fn delete_tag(&self, key: &str) -> Result<(), SerfError> {
        self.call("tags", &["-delete", key]).await.map(drop)
    }

    async fn agent_name(&self) -> Result<String, SerfError> {
        let info = self.info().await?;
        info.pointer("/agent/name")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| SerfError::Command("serf info did not report an agent name".to_string()))
    }

    /// Run `serf <command> -rpc-addr=<addr> <args>` and return its stdout.
    async fn call<S: AsRef<str>>(&self, command: &str, args: &[S]) -> Result<String, SerfError> {
        let mut cmd = Command::new(&self.serf);
        cmd.arg(command)
            .arg(format!("-rpc-addr={}", self.rpc_addr))
            .args(args.iter().map(AsRef::as_ref))
            .kill_on_drop(true);

        debug!(serf = %self.serf.display(), command, "Running serf");
        let output = cmd.output().await.map_err(|source| SerfError::Spawn {
            serf: self.serf.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let mut combined = stdout;
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(command, status = %output.status, output = %combined.trim_end(), "serf failed");
        Err(SerfError::from_output(&combined))
    }
}
