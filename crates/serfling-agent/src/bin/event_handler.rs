//! serfling-event-handler
//!
//! Installed as serf's event handler. Forwards the event to the serfling
//! relay at HOST:PORT and, for queries, prints the relay's reply so serf
//! sends it back as the query response.

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use serfling_core::event::{ENV_EVENT, SELF_TAG_PREFIXES, encode_frame};

#[derive(Parser, Debug)]
#[command(name = "serfling-event-handler")]
#[command(version, about = "Forward a serf event to a serfling relay")]
struct Args {
    /// Relay host
    host: String,
    /// Relay port
    port: u16,
}

/// Serf variables, plus self tags under any recognised prefix.
fn forwarded(name: &str) -> bool {
    name.starts_with("SERF") || SELF_TAG_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    serfling_core::tracing_init::init_tracing("serfling_event_handler=warn", false);

    let env: Vec<(String, String)> = std::env::vars_os()
        .map(|(name, value)| {
            (
                name.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .filter(|(name, _)| forwarded(name))
        .collect();
    let is_query = env
        .iter()
        .any(|(name, value)| name == ENV_EVENT && value == "query");

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("connecting to relay at {}:{}", args.host, args.port))?;

    let header = encode_frame(
        env.iter().map(|(name, value)| (name.as_str(), value.as_str())),
        &[],
    );
    stream.write_all(&header).await.context("sending event environment")?;

    let mut stdin = tokio::io::stdin();
    let sent = tokio::io::copy(&mut stdin, &mut stream)
        .await
        .context("forwarding event body")?;
    stream.shutdown().await.context("closing write half")?;
    debug!(body_bytes = sent, is_query, "Event forwarded");

    if is_query {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut stream, &mut stdout)
            .await
            .context("reading query reply")?;
        stdout.flush().await?;
    }
    Ok(())
}
