//! serfling Core Library
//!
//! Shared functionality for serfling components:
//! - Serf event wire frame decoding
//! - Member list and tag-set parsing
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod event;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, Member, decode};
