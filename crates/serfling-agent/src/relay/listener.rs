//! Event relay listener: accept loop, frame reading and dispatch.
//!
//! Frames are read on the accept loop, one connection at a time, so the
//! sequential queue sees events in the order the listener accepted them.
//! A connection is owned by exactly one task and closed when that task
//! drops it: the accept loop for ordinary events and malformed frames, the
//! query task for queries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use serfling_core::config::RelayConfig;
use serfling_core::{Event, decode};

use super::pool::{HandlerPermit, HandlerPool, PoolError};
use super::types::{DispatchMode, RelayError};
use crate::hooks::HookRegistry;
use crate::responder::ResponderTable;

/// Frames larger than this are discarded.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 2048;
/// Back-off after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A running event relay bound to a local TCP port.
///
/// Dropping the relay stops its accept loop; [`EventRelay::shutdown`] does
/// the same and waits for the loop to exit.
pub struct EventRelay {
    local_addr: SocketAddr,
    shared: Arc<RelayShared>,
    accept_task: Option<JoinHandle<()>>,
}

struct RelayShared {
    hooks: Arc<HookRegistry>,
    responders: Arc<ResponderTable>,
    config: RelayConfig,
    mode: DispatchMode,
    pool: Option<HandlerPool>,
    received: Arc<AtomicBool>,
    fault: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EventRelay {
    /// Bind an ephemeral port on the loopback interface and start accepting.
    pub async fn start(
        config: RelayConfig,
        hooks: Arc<HookRegistry>,
        responders: Arc<ResponderTable>,
    ) -> Result<Self, RelayError> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config, hooks, responders).await
    }

    /// Bind `addr` and start accepting.
    pub async fn bind(
        addr: SocketAddr,
        config: RelayConfig,
        hooks: Arc<HookRegistry>,
        responders: Arc<ResponderTable>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mode = DispatchMode::from_parallel(config.parallel_events);
        let shared = Arc::new(RelayShared {
            hooks,
            responders,
            pool: config.max_concurrent_handlers.map(HandlerPool::new),
            mode,
            config,
            received: Arc::new(AtomicBool::new(false)),
            fault: Mutex::new(None),
            shutdown_tx,
        });

        let queue_tx = match mode {
            DispatchMode::Sequential => {
                let (queue_tx, queue_rx) = mpsc::unbounded_channel();
                spawn_dispatcher(Arc::clone(&shared), queue_rx);
                Some(queue_tx)
            }
            DispatchMode::Parallel => None,
        };

        info!(
            addr = %local_addr,
            mode = ?mode,
            async_query = shared.config.async_query,
            "Event relay listening"
        );

        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&shared),
            listener,
            queue_tx,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            shared,
            accept_task: Some(accept_task),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mode(&self) -> DispatchMode {
        self.shared.mode
    }

    /// Whether at least one frame decoded since start or the last reset.
    pub fn received_event(&self) -> bool {
        self.shared.received.load(Ordering::Acquire)
    }

    pub fn reset_received(&self) {
        self.shared.received.store(false, Ordering::Release);
    }

    /// Shared handle to the received-event flag.
    pub fn received_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.received)
    }

    /// First handler failure that shut the relay down, when
    /// `propagate_handler_errors` is set.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// In-flight query tasks finish on their own; queued events that have
    /// not been dispatched yet are dropped.
    pub async fn shutdown(mut self) {
        self.shared.shutdown_tx.send_replace(true);
        if let Some(task) = self.accept_task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Event relay accept task failed");
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

fn spawn_dispatcher(shared: Arc<RelayShared>, mut queue_rx: mpsc::UnboundedReceiver<Event>) {
    // Hooks are synchronous callbacks; run them off the async workers.
    tokio::task::spawn_blocking(move || {
        while let Some(event) = queue_rx.blocking_recv() {
            if shared.is_shutting_down() {
                break;
            }
            shared.dispatch(&event);
        }
        debug!("Event dispatcher finished");
    });
}

async fn accept_loop(
    shared: Arc<RelayShared>,
    listener: TcpListener,
    queue_tx: Option<mpsc::UnboundedSender<Event>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept relay connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            () = shared.handle_connection(stream, peer, queue_tx.as_ref()) => {}
        }
        if shared.is_shutting_down() {
            break;
        }
    }

    if let Some(pool) = &shared.pool {
        pool.close();
    }
    info!("Event relay stopped");
}

impl RelayShared {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn handle_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        queue_tx: Option<&mpsc::UnboundedSender<Event>>,
    ) {
        let raw = match read_frame(&mut stream, self.config.read_timeout()).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(%peer, error = %e, "Failed to read event frame");
                return;
            }
        };
        let Some(event) = decode(&raw) else {
            debug!(%peer, bytes = raw.len(), "Dropping malformed event frame");
            return;
        };

        self.received.store(true, Ordering::Release);
        debug!(%peer, kind = %event.kind(), "Event received");

        if event.is_query() {
            if self.config.async_query {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let Ok(_permit) = shared.permit().await else {
                        debug!("Relay shutting down; dropping query");
                        return;
                    };
                    shared.handle_query(event, stream).await;
                });
            } else {
                self.handle_query(event, stream).await;
            }
            return;
        }

        // No reply expected: release the helper before running hooks.
        drop(stream);

        match queue_tx {
            Some(queue_tx) => {
                if queue_tx.send(event).is_err() {
                    warn!("Event queue closed; dropping event");
                }
            }
            None => {
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let Ok(_permit) = shared.permit().await else {
                        debug!("Relay shutting down; dropping event");
                        return;
                    };
                    let worker = Arc::clone(&shared);
                    if let Err(e) = tokio::task::spawn_blocking(move || worker.dispatch(&event)).await {
                        error!(error = %e, "Event handler task failed");
                    }
                });
            }
        }
    }

    async fn handle_query(self: &Arc<Self>, event: Event, mut stream: TcpStream) {
        let shared = Arc::clone(self);
        let reply = match tokio::task::spawn_blocking(move || {
            shared.dispatch(&event);
            shared.respond(&event)
        })
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Query handler task failed");
                return;
            }
        };

        if let Some(reply) = reply
            && let Err(e) = stream.write_all(&reply).await
        {
            warn!(error = %e, "Failed to write query reply");
            return;
        }
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Failed to shut down query connection");
        }
    }

    async fn permit(&self) -> Result<Option<HandlerPermit>, PoolError> {
        match &self.pool {
            Some(pool) => pool.acquire().await.map(Some),
            None => Ok(None),
        }
    }

    /// Fire the hooks for one event.
    fn dispatch(&self, event: &Event) {
        let failures = self.hooks.fire(&event.kind().hook_name(), event);
        if let Some(first) = failures.first() {
            self.record_fault(first.to_string());
        }
    }

    /// Compute the reply for a query, if a responder is registered.
    fn respond(&self, event: &Event) -> Option<Vec<u8>> {
        let name = event.query_name()?;
        match self.responders.respond_to(name, event) {
            Ok(reply) => reply,
            Err(e) => {
                error!(?event, error = %e, "Query responder failed");
                self.record_fault(e.to_string());
                None
            }
        }
    }

    fn record_fault(&self, message: String) {
        if !self.config.propagate_handler_errors {
            return;
        }
        let mut fault = self.fault.lock();
        if fault.is_none() {
            error!(error = %message, "Handler failed; shutting down event relay");
            *fault = Some(message);
        }
        drop(fault);
        self.shutdown_tx.send_replace(true);
    }
}

/// Read until the peer half-closes or no data arrives for `idle`.
async fn read_frame(stream: &mut TcpStream, idle: Duration) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    loop {
        match tokio::time::timeout(idle, stream.read_buf(&mut buf)).await {
            Err(_) => {
                debug!(bytes = buf.len(), "Idle timeout while reading event frame");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                if buf.len() > MAX_FRAME_BYTES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "event frame too large",
                    ));
                }
            }
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn read_frame_stops_at_half_close() {
        let (mut client, mut server) = connected_pair().await;
        client.write_all(b"SERF_EVENT=user\0\0body").await.unwrap();
        client.shutdown().await.unwrap();

        let raw = read_frame(&mut server, Duration::from_secs(5)).await.unwrap();
        assert_eq!(raw, b"SERF_EVENT=user\0\0body");
    }

    #[tokio::test]
    async fn read_frame_stops_at_idle_timeout() {
        let (mut client, mut server) = connected_pair().await;
        client.write_all(b"SERF_EVENT=user\0\0").await.unwrap();

        let raw = read_frame(&mut server, Duration::from_millis(100)).await.unwrap();
        assert_eq!(raw, b"SERF_EVENT=user\0\0");
        drop(client);
    }
}
