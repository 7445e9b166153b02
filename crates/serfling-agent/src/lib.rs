//! serfling agent: supervises a serf agent process and relays its events
//! to in-process hooks and query responders.
//!
//! - [`relay`] -- TCP listener receiving frames from the event handler helper
//! - [`supervisor`] -- agent process lifecycle and typed hook registration
//! - [`hooks`] / [`responder`] -- callback tables shared with the relay
//! - [`client`] -- commands against a running agent via the `serf` CLI

pub mod client;
pub mod hooks;
pub mod relay;
pub mod responder;
pub mod supervisor;

pub use hooks::{HookFailure, HookRegistry, HookResult};
pub use relay::{DispatchMode, EventRelay, RelayError};
pub use responder::{ResponderError, ResponderTable};
pub use supervisor::{AgentLauncher, AgentState, SerfCommand, Supervisor, SupervisorError};
