//! Client subcommands: thin CLI over [`SerfClient`].

use std::time::Duration;

use clap::Subcommand;

use serfling_agent::client::{MemberFilter, QueryOptions, SerfClient};

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// List cluster members, one per line
    Members {
        /// Only members with this status (alive, failed, left, ...)
        #[arg(long)]
        status: Option<String>,
        /// Only members whose name matches this pattern
        #[arg(long)]
        name: Option<String>,
        /// Only members with this tag (repeatable)
        #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = super::parse_key_value)]
        tags: Vec<(String, String)>,
    },
    /// Broadcast a user event
    Event {
        name: String,
        #[arg(default_value = "")]
        payload: String,
        /// Send even if a newer event with the same name is pending
        #[arg(long)]
        no_coalesce: bool,
    },
    /// Send a query and print the acks and responses
    Query {
        name: String,
        #[arg(default_value = "")]
        payload: String,
        /// Only ask this node (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Only ask nodes with this tag, KEY=VALUE (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Query timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        no_ack: bool,
    },
    /// Join an existing cluster member
    Join {
        addr: String,
        #[arg(long)]
        replay: bool,
    },
    /// Gracefully leave the cluster and shut the agent down
    Leave,
    /// Force a failed member into the left state
    ForceLeave { node: String },
    /// Show or change the local node's tags
    Tags {
        /// Set a tag (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = super::parse_key_value)]
        set: Vec<(String, String)>,
        /// Delete a tag (repeatable)
        #[arg(long = "delete", value_name = "KEY")]
        delete: Vec<String>,
        /// Node name, when it differs from the configured node
        #[arg(long)]
        node: Option<String>,
    },
}

#[allow(clippy::print_stdout)]
pub async fn run(client: &SerfClient, command: ClientCommand) -> anyhow::Result<()> {
    match command {
        ClientCommand::Members { status, name, tags } => {
            let filter = MemberFilter {
                status,
                name,
                tags: tags.into_iter().collect(),
            };
            for member in client.members(&filter).await? {
                let tags: Vec<String> = member
                    .tags
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    member.name,
                    member.addr,
                    member.status,
                    tags.join(",")
                );
            }
        }
        ClientCommand::Event {
            name,
            payload,
            no_coalesce,
        } => {
            client.event(&name, &payload, !no_coalesce).await?;
        }
        ClientCommand::Query {
            name,
            payload,
            nodes,
            tags,
            timeout,
            no_ack,
        } => {
            let options = QueryOptions {
                nodes,
                tags,
                timeout: timeout.map(Duration::from_secs),
                no_ack,
            };
            let reply = client.query(&name, &payload, &options).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        ClientCommand::Join { addr, replay } => client.join(&addr, replay).await?,
        ClientCommand::Leave => client.leave().await?,
        ClientCommand::ForceLeave { node } => client.force_leave(&node).await?,
        ClientCommand::Tags { set, delete, node } => {
            let client = match node {
                Some(node) => client.clone().with_name(node),
                None => client.clone(),
            };
            let mut tags = client.tags().await?;
            for (key, value) in &set {
                tags.set(key, Some(value)).await?;
            }
            for key in &delete {
                tags.delete(key).await?;
            }
            println!("{}", serde_json::to_string_pretty(&tags.to_map())?);
        }
    }
    Ok(())
}
