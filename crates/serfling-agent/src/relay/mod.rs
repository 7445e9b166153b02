//! Event relay: the local TCP listener the event handler helper reports to.
//!
//! ```text
//! serf agent → serfling-event-handler → TCP frame → decode
//!   query     → hooks + responder → reply on the same connection
//!   otherwise → sequential queue | parallel task → hooks
//! ```

mod listener;
mod pool;
mod types;

pub use listener::EventRelay;
pub use pool::{HandlerPermit, HandlerPool, PoolError};
pub use types::*;
