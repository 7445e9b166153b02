#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the event relay.
//!
//! Frames are written over real TCP connections exactly as the event
//! handler helper writes them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use serfling_agent::hooks::WILDCARD;
use serfling_agent::{EventRelay, HookRegistry, ResponderTable};
use serfling_core::config::RelayConfig;
use serfling_core::event::encode_frame;

async fn start_relay(config: RelayConfig) -> (EventRelay, Arc<HookRegistry>, Arc<ResponderTable>) {
    let hooks = Arc::new(HookRegistry::new());
    let responders = Arc::new(ResponderTable::new());
    let relay = EventRelay::start(config, Arc::clone(&hooks), Arc::clone(&responders))
        .await
        .unwrap();
    (relay, hooks, responders)
}

/// Send one frame, half-close, and return whatever the relay writes back.
async fn send(addr: SocketAddr, frame: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(frame).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    reply
}

fn user_event(name: &str, payload: &str) -> Vec<u8> {
    encode_frame(
        [("SERF_EVENT", "user"), ("SERF_USER_EVENT", name), ("SERF_USER_LTIME", "1")],
        payload.as_bytes(),
    )
}

fn query(name: &str, payload: &[u8]) -> Vec<u8> {
    encode_frame(
        [("SERF_EVENT", "query"), ("SERF_QUERY_NAME", name), ("SERF_QUERY_LTIME", "3")],
        payload,
    )
}

async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn membership_hooks_receive_decoded_members() {
    let (relay, hooks, _) = start_relay(RelayConfig::default()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    hooks.register("member-join", move |event| {
        let members = event.members().unwrap_or_default();
        s.lock().extend(members.iter().map(|m| (m.name.clone(), m.tags.clone())));
        Ok(())
    });

    assert!(!relay.received_event());
    let frame = encode_frame(
        [("SERF_EVENT", "member-join"), ("SERF_SELF_NAME", "n0")],
        b"n1\t10.0.0.1\t\trole=web,dc=east\nn2\t10.0.0.2\t\t\n",
    );
    send(relay.local_addr(), &frame).await;

    assert!(eventually(Duration::from_secs(5), || seen.lock().len() == 2).await);
    let seen = seen.lock().clone();
    assert_eq!(seen[0].0, "n1");
    assert_eq!(seen[0].1["role"], "web");
    assert_eq!(seen[0].1["dc"], "east");
    assert_eq!(seen[1].0, "n2");
    assert!(seen[1].1.is_empty());
    assert!(relay.received_event());

    relay.shutdown().await;
}

#[tokio::test]
async fn sequential_mode_preserves_arrival_order() {
    let (relay, hooks, _) = start_relay(RelayConfig::default()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    hooks.register("user", move |event| {
        let index: u64 = event.payload_str().parse()?;
        // Earlier events take longer; order must still hold.
        std::thread::sleep(Duration::from_millis((5 - index) * 20));
        o.lock().push(index);
        Ok(())
    });

    for i in 0..5 {
        send(relay.local_addr(), &user_event("tick", &i.to_string())).await;
    }

    assert!(eventually(Duration::from_secs(5), || order.lock().len() == 5).await);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);

    relay.shutdown().await;
}

#[tokio::test]
async fn parallel_mode_handles_many_slow_events() {
    let config = RelayConfig {
        parallel_events: true,
        max_concurrent_handlers: Some(8),
        ..RelayConfig::default()
    };
    let (relay, hooks, _) = start_relay(config).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&handled);
    hooks.register(WILDCARD, move |_| {
        std::thread::sleep(Duration::from_millis(50));
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let started = Instant::now();
    for i in 0..40 {
        send(relay.local_addr(), &user_event("burst", &i.to_string())).await;
    }

    assert!(eventually(Duration::from_secs(10), || handled.load(Ordering::SeqCst) == 40).await);
    // Forty 50ms hooks one after another would take two seconds.
    assert!(started.elapsed() < Duration::from_secs(2));

    relay.shutdown().await;
}

#[tokio::test]
async fn query_reply_is_returned_byte_for_byte() {
    let (relay, hooks, responders) = start_relay(RelayConfig::default()).await;
    let query_hooks = Arc::new(AtomicUsize::new(0));
    let q = Arc::clone(&query_hooks);
    hooks.register("query", move |_| {
        q.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    responders
        .register("blob", false, |event| {
            let mut reply = vec![0_u8, 1, 2, 0xff, b'\n'];
            reply.extend_from_slice(event.payload());
            Ok(reply)
        })
        .unwrap();

    let reply = send(relay.local_addr(), &query("blob", b"\0tail")).await;

    assert_eq!(reply, [0, 1, 2, 0xff, b'\n', 0, b't', b'a', b'i', b'l']);
    assert_eq!(query_hooks.load(Ordering::SeqCst), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn synchronous_queries_reply_too() {
    let config = RelayConfig {
        async_query: false,
        ..RelayConfig::default()
    };
    let (relay, _, responders) = start_relay(config).await;
    responders.register("ping", false, |_| Ok("pong")).unwrap();

    assert_eq!(send(relay.local_addr(), &query("ping", b"")).await, b"pong");
    assert_eq!(send(relay.local_addr(), &query("ping", b"")).await, b"pong");

    relay.shutdown().await;
}

#[tokio::test]
async fn query_without_responder_closes_without_reply() {
    let (relay, _, responders) = start_relay(RelayConfig::default()).await;
    responders
        .register("failing", false, |_| -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("no answer")
        })
        .unwrap();

    assert!(send(relay.local_addr(), &query("unknown", b"x")).await.is_empty());
    assert!(send(relay.local_addr(), &query("failing", b"x")).await.is_empty());
    assert!(relay.fault().is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (relay, hooks, _) = start_relay(RelayConfig::default()).await;
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    hooks.register(WILDCARD, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    send(relay.local_addr(), b"no separator at all").await;
    send(relay.local_addr(), b"SERF_SELF_NAME=n0\0\0body").await;
    assert!(!relay.received_event());

    send(relay.local_addr(), &user_event("after", "ok")).await;
    assert!(eventually(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1).await);
    assert!(relay.received_event());
    assert!(relay.is_running());

    relay.shutdown().await;
}

#[tokio::test]
async fn handler_failures_are_isolated_by_default() {
    let (relay, hooks, _) = start_relay(RelayConfig::default()).await;
    let count = Arc::new(AtomicUsize::new(0));
    hooks.register("user", |_| anyhow::bail!("broken hook"));
    let c = Arc::clone(&count);
    hooks.register("user", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    send(relay.local_addr(), &user_event("a", "1")).await;
    send(relay.local_addr(), &user_event("b", "2")).await;

    assert!(eventually(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 2).await);
    assert!(relay.is_running());
    assert!(relay.fault().is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn propagated_failure_shuts_the_relay_down() {
    let config = RelayConfig {
        propagate_handler_errors: true,
        ..RelayConfig::default()
    };
    let (relay, hooks, _) = start_relay(config).await;
    hooks.register("user", |_| anyhow::bail!("fatal hook"));

    send(relay.local_addr(), &user_event("a", "1")).await;

    assert!(eventually(Duration::from_secs(5), || !relay.is_running()).await);
    assert!(relay.fault().unwrap().contains("fatal hook"));

    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (relay, _, _) = start_relay(RelayConfig::default()).await;
    let addr = relay.local_addr();
    relay.shutdown().await;

    assert!(TcpStream::connect(addr).await.is_err());
}
