#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Integration tests for agent supervision.
//!
//! A shell script stands in for `serf agent`; the end-to-end tests run the
//! real `serfling-event-handler` binary against the supervisor's relay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::Command;

use serfling_agent::{AgentState, Supervisor, SupervisorError};
use serfling_core::config::{RelayConfig, SupervisorConfig};

const HELPER: &str = env!("CARGO_BIN_EXE_serfling-event-handler");

/// Supervisor whose agent is `sh -c <script> <helper> <relay ip> <relay port> <extra>...`.
fn scripted(script: &'static str, extra: Vec<String>) -> Supervisor {
    Supervisor::new(
        move |relay: SocketAddr| -> std::io::Result<Command> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(script)
                .arg(HELPER)
                .arg(relay.ip().to_string())
                .arg(relay.port().to_string())
                .args(&extra);
            Ok(cmd)
        },
        RelayConfig::default(),
        SupervisorConfig::default(),
    )
}

fn sleeper() -> Supervisor {
    scripted("exec sleep 30", Vec::new())
}

/// Records what every stop hook call received: `None` for a requested
/// stop, otherwise whether the agent exited successfully.
fn record_stops(supervisor: &Supervisor) -> Arc<Mutex<Vec<Option<bool>>>> {
    let stops = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&stops);
    supervisor.on_stop(move |status| {
        s.lock().push(status.map(|status| status.success()));
        Ok(())
    });
    stops
}

async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn start_twice_then_stop() {
    let supervisor = sleeper();
    let stops = record_stops(&supervisor);

    let pid = supervisor.start().await.unwrap();
    assert_eq!(supervisor.pid(), Some(pid));
    assert_eq!(supervisor.state(), AgentState::Running);
    assert!(supervisor.started());
    assert!(supervisor.running());
    assert!(supervisor.relay_addr().is_some());

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyStarted { pid: p } if p == pid));

    let status = supervisor.stop().await.unwrap();
    assert!(status.is_some());
    assert_eq!(supervisor.state(), AgentState::Stopped);
    assert!(supervisor.pid().is_none());
    assert!(!supervisor.running());
    assert!(!supervisor.dead());
    assert!(supervisor.relay_addr().is_none());
    assert_eq!(*stops.lock(), vec![None]);

    let err = supervisor.stop().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning));
}

#[tokio::test]
async fn requested_stops_never_report_an_exit_status() {
    let supervisor = sleeper();
    let stops = record_stops(&supervisor);

    for _ in 0..50 {
        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), AgentState::Stopped);
    }

    let stops = stops.lock();
    assert_eq!(stops.len(), 50);
    assert!(stops.iter().all(Option::is_none), "{stops:?}");
}

#[tokio::test]
async fn crash_is_detected_and_restart_reuses_relay() {
    let supervisor = sleeper();
    let stops = record_stops(&supervisor);

    let pid = supervisor.start().await.unwrap();
    let relay_addr = supervisor.relay_addr().unwrap();

    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    assert!(eventually(Duration::from_secs(5), || supervisor.dead()).await);
    assert_eq!(supervisor.state(), AgentState::Crashed);
    assert!(supervisor.started());
    assert!(!supervisor.running());
    assert!(!supervisor.exit_status().unwrap().success());
    assert!(eventually(Duration::from_secs(5), || stops.lock().len() == 1).await);
    assert_eq!(*stops.lock(), vec![Some(false)]);

    let restarted = supervisor.start().await.unwrap();
    assert_ne!(restarted, pid);
    assert_eq!(supervisor.relay_addr(), Some(relay_addr));
    assert!(supervisor.running());

    supervisor.stop().await.unwrap();
    assert_eq!(*stops.lock(), vec![Some(false), None]);
}

#[tokio::test]
async fn stop_kills_an_agent_ignoring_sigint() {
    let supervisor = scripted("trap '' INT; exec sleep 30", Vec::new());
    supervisor.start().await.unwrap();

    let started = Instant::now();
    let status = supervisor
        .stop_with_timeout(Duration::from_millis(300))
        .await
        .unwrap();

    assert!(!status.unwrap().success());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.state(), AgentState::Stopped);
}

#[tokio::test]
async fn wait_for_ready_times_out_without_events() {
    let supervisor = sleeper();
    supervisor.start().await.unwrap();

    let err = supervisor
        .wait_for_ready(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ReadyTimeout { .. }));
    assert!(!supervisor.ready());

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn wait_for_ready_reports_early_exit() {
    let supervisor = scripted("exit 3", Vec::new());
    supervisor.start().await.unwrap();

    let err = supervisor
        .wait_for_ready(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Exited { status } if status.code() == Some(3)));
}

#[tokio::test]
async fn events_flow_through_the_helper() {
    let supervisor = scripted(
        r#"printf 'n1\t10.0.0.1\t\trole=web\n' | SERF_EVENT=member-join SERF_SELF_NAME=n0 SERF_TAG_role=lb "$0" "$1" "$2"
exec sleep 30"#,
        Vec::new(),
    );
    let joined = Arc::new(Mutex::new(Vec::new()));
    let j = Arc::clone(&joined);
    supervisor.on_member_join(move |event| {
        let members = event.members().unwrap_or_default();
        j.lock().push((
            event.self_name().map(ToString::to_string),
            event.self_tags().get("role").cloned(),
            members.iter().map(|m| m.address.clone()).collect::<Vec<_>>(),
        ));
        Ok(())
    });

    supervisor.start().await.unwrap();
    supervisor
        .wait_for_ready(Duration::from_secs(10))
        .await
        .unwrap();
    assert!(supervisor.ready());

    assert!(eventually(Duration::from_secs(5), || !joined.lock().is_empty()).await);
    let (self_name, self_role, addresses) = joined.lock()[0].clone();
    assert_eq!(self_name.as_deref(), Some("n0"));
    assert_eq!(self_role.as_deref(), Some("lb"));
    assert_eq!(addresses, vec!["10.0.0.1".to_string()]);

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn query_reply_reaches_helper_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out: PathBuf = dir.path().join("reply");
    let supervisor = scripted(
        r#"printf 'hello' | SERF_EVENT=query SERF_QUERY_NAME=greet "$0" "$1" "$2" > "$3.tmp" && mv "$3.tmp" "$3"
exec sleep 30"#,
        vec![out.display().to_string()],
    );
    supervisor
        .respond("greet", false, |event| {
            Ok(format!("{}, world", event.payload_str()))
        })
        .unwrap();

    supervisor.start().await.unwrap();

    assert!(eventually(Duration::from_secs(10), || out.exists()).await);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello, world");

    let err = supervisor.respond("greet", false, |_| Ok("again")).unwrap_err();
    assert!(err.to_string().contains("override"));

    supervisor.stop().await.unwrap();
}
