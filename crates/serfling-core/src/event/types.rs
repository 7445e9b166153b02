//! Event model types.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

use super::tags::parse_tags;

/// Environment key carrying the event kind.
pub const ENV_EVENT: &str = "SERF_EVENT";
/// Environment key carrying the local node name.
pub const ENV_SELF_NAME: &str = "SERF_SELF_NAME";
/// Environment key carrying the user event name.
pub const ENV_USER_EVENT: &str = "SERF_USER_EVENT";
/// Environment key carrying the query name.
pub const ENV_QUERY_NAME: &str = "SERF_QUERY_NAME";
/// Environment key carrying the user event Lamport time.
pub const ENV_USER_LTIME: &str = "SERF_USER_LTIME";
/// Environment key carrying the query Lamport time.
pub const ENV_QUERY_LTIME: &str = "SERF_QUERY_LTIME";
/// Prefixes of environment keys holding the local node's tags.
pub const SELF_TAG_PREFIXES: [&str; 2] = ["SERF_TAG_", "SELFAGENT_TAG_"];

/// Kind of a Serf event, as carried in `SERF_EVENT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    MemberJoin,
    MemberLeave,
    MemberFailed,
    MemberUpdate,
    MemberReap,
    User,
    Query,
    /// Any kind this crate does not know about; kept verbatim.
    Other(String),
}

impl EventKind {
    /// Parse the wire representation (`member-join`, `user`, ...).
    pub fn parse(raw: &str) -> Self {
        match raw {
            "member-join" => Self::MemberJoin,
            "member-leave" => Self::MemberLeave,
            "member-failed" => Self::MemberFailed,
            "member-update" => Self::MemberUpdate,
            "member-reap" => Self::MemberReap,
            "user" => Self::User,
            "query" => Self::Query,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire representation of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::MemberJoin => "member-join",
            Self::MemberLeave => "member-leave",
            Self::MemberFailed => "member-failed",
            Self::MemberUpdate => "member-update",
            Self::MemberReap => "member-reap",
            Self::User => "user",
            Self::Query => "query",
            Self::Other(raw) => raw,
        }
    }

    /// Name under which hooks for this kind are registered.
    pub fn hook_name(&self) -> String {
        self.as_str().replace('-', "_")
    }

    /// Whether the payload of this kind is a member list.
    pub const fn is_membership(&self) -> bool {
        matches!(
            self,
            Self::MemberJoin
                | Self::MemberLeave
                | Self::MemberFailed
                | Self::MemberUpdate
                | Self::MemberReap
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cluster member listed in a membership event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub name: String,
    pub address: String,
    pub tags: BTreeMap<String, String>,
}

/// A single Serf event as delivered through the relay.
///
/// Built once per decoded frame and never mutated afterwards. The member
/// list is parsed on first access and only for membership kinds.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    self_name: Option<String>,
    self_tags: BTreeMap<String, String>,
    user_event_name: Option<String>,
    query_name: Option<String>,
    user_logical_time: Option<String>,
    query_logical_time: Option<String>,
    payload: Vec<u8>,
    members: OnceLock<Vec<Member>>,
}

impl Event {
    /// Build an event from forwarded environment variables and a body.
    ///
    /// Returns `None` when `SERF_EVENT` is missing. Unknown keys are ignored.
    pub fn from_env<I, K, V>(env: I, payload: Vec<u8>) -> Option<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut kind = None;
        let mut event = Self {
            kind: EventKind::Other(String::new()),
            self_name: None,
            self_tags: BTreeMap::new(),
            user_event_name: None,
            query_name: None,
            user_logical_time: None,
            query_logical_time: None,
            payload,
            members: OnceLock::new(),
        };

        for (key, value) in env {
            let key = key.as_ref();
            let value: String = value.into();
            match key {
                ENV_EVENT => kind = Some(EventKind::parse(&value)),
                ENV_SELF_NAME => event.self_name = Some(value),
                ENV_USER_EVENT => event.user_event_name = Some(value),
                ENV_QUERY_NAME => event.query_name = Some(value),
                ENV_USER_LTIME => event.user_logical_time = Some(value),
                ENV_QUERY_LTIME => event.query_logical_time = Some(value),
                _ => {
                    if let Some(tag) = SELF_TAG_PREFIXES
                        .iter()
                        .find_map(|prefix| key.strip_prefix(prefix))
                    {
                        event.self_tags.insert(tag.to_string(), value);
                    }
                }
            }
        }

        event.kind = kind?;
        Some(event)
    }

    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn self_name(&self) -> Option<&str> {
        self.self_name.as_deref()
    }

    pub const fn self_tags(&self) -> &BTreeMap<String, String> {
        &self.self_tags
    }

    pub fn user_event_name(&self) -> Option<&str> {
        self.user_event_name.as_deref()
    }

    pub fn query_name(&self) -> Option<&str> {
        self.query_name.as_deref()
    }

    pub fn user_logical_time(&self) -> Option<&str> {
        self.user_logical_time.as_deref()
    }

    pub fn query_logical_time(&self) -> Option<&str> {
        self.query_logical_time.as_deref()
    }

    /// Lamport time of the event: the user time if present, else the query time.
    pub fn logical_time(&self) -> Option<&str> {
        self.user_logical_time().or_else(|| self.query_logical_time())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_query(&self) -> bool {
        self.kind == EventKind::Query
    }

    /// Member records carried by a membership event, in payload order.
    ///
    /// Always `None` for non-membership kinds.
    pub fn members(&self) -> Option<&[Member]> {
        if !self.kind.is_membership() {
            return None;
        }
        Some(
            self.members
                .get_or_init(|| parse_members(&self.payload_str())),
        )
    }
}

/// Parse a member list payload: one member per line, tab separated as
/// `name, address, (unused), tags`.
fn parse_members(payload: &str) -> Vec<Member> {
    payload
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut columns = line.split('\t');
            let name = columns.next().unwrap_or_default().to_string();
            let address = columns.next().unwrap_or_default().to_string();
            let _ = columns.next();
            let tags = columns.next().map(parse_tags).unwrap_or_default();
            Member {
                name,
                address,
                tags,
            }
        })
        .collect()
}
