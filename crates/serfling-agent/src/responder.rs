//! Responder table: query name to the callback producing its reply.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use serfling_core::Event;

use crate::hooks::invoke;

/// Callback computing the reply body for a query.
pub type Responder = Arc<dyn Fn(&Event) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Errors from responder registration and invocation.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("Responder for {name} already exists. To force, pass override = true")]
    ResponderExists { name: String },

    #[error("Responder for {name} failed: {message}")]
    Failed { name: String, message: String },
}

/// One responder per query name.
#[derive(Default)]
pub struct ResponderTable {
    responders: RwLock<HashMap<String, Responder>>,
}

impl ResponderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the responder for `name`.
    ///
    /// Fails with [`ResponderError::ResponderExists`] when `name` is taken
    /// and `override_existing` is false.
    pub fn register<F, R>(
        &self,
        name: &str,
        override_existing: bool,
        responder: F,
    ) -> Result<(), ResponderError>
    where
        F: Fn(&Event) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Vec<u8>>,
    {
        let mut responders = self.responders.write();
        if !override_existing && responders.contains_key(name) {
            return Err(ResponderError::ResponderExists {
                name: name.to_string(),
            });
        }
        responders.insert(
            name.to_string(),
            Arc::new(move |event: &Event| responder(event).map(Into::into)),
        );
        drop(responders);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.responders.read().contains_key(name)
    }

    /// Compute the reply for `event` with the responder registered as `name`.
    ///
    /// `Ok(None)` when no responder exists. Errors and panics in the
    /// callback come back as [`ResponderError::Failed`].
    pub fn respond_to(&self, name: &str, event: &Event) -> Result<Option<Vec<u8>>, ResponderError> {
        let Some(responder) = self.responders.read().get(name).cloned() else {
            return Ok(None);
        };

        invoke(|| responder(event))
            .map(Some)
            .map_err(|message| ResponderError::Failed {
                name: name.to_string(),
                message,
            })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serfling_core::decode;

    fn query(name: &str) -> Event {
        let frame = format!("SERF_EVENT=query\0SERF_QUERY_NAME={name}\0\0ping");
        decode(frame.as_bytes()).unwrap()
    }

    #[test]
    fn returns_reply_bytes() {
        let table = ResponderTable::new();
        table
            .register("q", false, |event| {
                Ok(format!("pong:{}", event.payload_str()))
            })
            .unwrap();

        let reply = table.respond_to("q", &query("q")).unwrap();
        assert_eq!(reply.as_deref(), Some(&b"pong:ping"[..]));
    }

    #[test]
    fn missing_responder_is_none() {
        let table = ResponderTable::new();
        assert!(table.respond_to("q", &query("q")).unwrap().is_none());
    }

    #[test]
    fn duplicate_registration_fails_without_override() {
        let table = ResponderTable::new();
        table.register("q", false, |_| Ok("first")).unwrap();

        let err = table.register("q", false, |_| Ok("second")).unwrap_err();
        assert!(matches!(err, ResponderError::ResponderExists { ref name } if name == "q"));

        let reply = table.respond_to("q", &query("q")).unwrap();
        assert_eq!(reply.as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn override_replaces_responder() {
        let table = ResponderTable::new();
        table.register("q", false, |_| Ok("first")).unwrap();
        table.register("q", true, |_| Ok(vec![1_u8, 2, 3])).unwrap();

        let reply = table.respond_to("q", &query("q")).unwrap();
        assert_eq!(reply, Some(vec![1, 2, 3]));
    }

    #[test]
    fn failing_responder_is_reported() {
        let table = ResponderTable::new();
        table
            .register("q", false, |_| -> anyhow::Result<String> { anyhow::bail!("no data") })
            .unwrap();

        let err = table.respond_to("q", &query("q")).unwrap_err();
        assert!(matches!(err, ResponderError::Failed { ref message, .. } if message == "no data"));
    }
}
