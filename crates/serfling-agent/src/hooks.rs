//! Hook registry: event kind name to ordered callbacks.
//!
//! Hooks are keyed by the event kind with dashes replaced by underscores
//! (`member-join` registers as `member_join`). Every fired event is also
//! delivered to the wildcard `event` hooks, after the kind-specific ones.
//! The registry only grows; there is no removal.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::ExitStatus;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use serfling_core::Event;

/// Hook name receiving every event.
pub const WILDCARD: &str = "event";
/// Hook name fired when the agent process stops.
pub const STOP: &str = "stop";

/// Result returned by hook callbacks.
pub type HookResult = anyhow::Result<()>;

/// Callback observing an event.
pub type EventHook = Arc<dyn Fn(&Event) -> HookResult + Send + Sync>;

/// Callback observing agent termination. Receives `None` for a requested
/// stop and the exit status for a detected exit.
pub type StopHook = Arc<dyn Fn(Option<ExitStatus>) -> HookResult + Send + Sync>;

/// A hook that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    /// Hook name the failing callback was registered under.
    pub hook: String,
    /// Position of the callback within that hook's list.
    pub index: usize,
    pub message: String,
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hook {}[{}] failed: {}", self.hook, self.index, self.message)
    }
}

/// Normalize a kind or hook name for registry lookup.
pub fn normalize(kind: &str) -> String {
    kind.replace('-', "_")
}

/// Registry of event and stop hooks.
#[derive(Default)]
pub struct HookRegistry {
    event_hooks: RwLock<HashMap<String, Vec<EventHook>>>,
    stop_hooks: RwLock<Vec<StopHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event hook for `kind` (or [`WILDCARD`]).
    pub fn register<F>(&self, kind: &str, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.event_hooks
            .write()
            .entry(normalize(kind))
            .or_default()
            .push(Arc::new(hook));
    }

    /// Append a stop hook.
    pub fn register_stop<F>(&self, hook: F)
    where
        F: Fn(Option<ExitStatus>) -> HookResult + Send + Sync + 'static,
    {
        self.stop_hooks.write().push(Arc::new(hook));
    }

    /// Number of callbacks registered under `kind`.
    pub fn count(&self, kind: &str) -> usize {
        let kind = normalize(kind);
        if kind == STOP {
            return self.stop_hooks.read().len();
        }
        self.event_hooks.read().get(&kind).map_or(0, Vec::len)
    }

    /// Run the hooks for `kind`, then the wildcard hooks, with `event`.
    ///
    /// Failures are logged and collected; they never stop the remaining
    /// callbacks from running.
    pub fn fire(&self, kind: &str, event: &Event) -> Vec<HookFailure> {
        let kind = normalize(kind);
        let mut failures = Vec::new();
        if kind != WILDCARD {
            self.run_event_hooks(&kind, event, &mut failures);
        }
        self.run_event_hooks(WILDCARD, event, &mut failures);
        failures
    }

    /// Run the stop hooks with `status`.
    pub fn fire_stop(&self, status: Option<ExitStatus>) -> Vec<HookFailure> {
        // Snapshot so a hook may register further hooks without deadlocking.
        let hooks = self.stop_hooks.read().clone();
        let mut failures = Vec::new();
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(message) = invoke(|| hook(status)) {
                error!(hook = STOP, index, ?status, error = %message, "Stop hook failed");
                failures.push(HookFailure {
                    hook: STOP.to_string(),
                    index,
                    message,
                });
            }
        }
        failures
    }

    fn run_event_hooks(&self, name: &str, event: &Event, failures: &mut Vec<HookFailure>) {
        let hooks = match self.event_hooks.read().get(name) {
            Some(hooks) => hooks.clone(),
            None => return,
        };
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(message) = invoke(|| hook(event)) {
                error!(hook = name, index, ?event, error = %message, "Event hook failed");
                failures.push(HookFailure {
                    hook: name.to_string(),
                    index,
                    message,
                });
            }
        }
    }
}

/// Run a callback, turning an error or a panic into a message.
pub(crate) fn invoke<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .map_or_else(|| "panic".to_string(), |msg| format!("panic: {msg}"))
}
