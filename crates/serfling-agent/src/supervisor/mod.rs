//! Agent process supervision.

pub mod launcher;
pub mod manager;

pub use launcher::{AgentLauncher, EVENT_HANDLER_BIN, SerfCommand, default_event_handler};
pub use manager::{AgentState, Supervisor, SupervisorError};
