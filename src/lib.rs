pub mod config;
pub mod router;
pub mod scheduler;
pub mod transport;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical name of a channel on the bus (e.g. `stat`, `log`, `heartbeat`).
///
/// Route keys are opaque to the router: they only serve as lookup keys into
/// the route table. Messages addressed to a key without a table entry are
/// unroutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouteKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Identifier of an agent on a monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Routing metadata plus opaque payload, as it travels across the bus.
///
/// The router inspects `to` for dispatch and forwards the envelope
/// otherwise untouched. The payload is never interpreted here; sinks and
/// agents agree on its encoding out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination route key.
    pub to: RouteKey,

    /// Originating (or, for plugin dispatches, target) agent.
    pub from: AgentId,

    /// Whether the sender expects an acknowledgement. Resending
    /// unacknowledged envelopes is the sender's responsibility, not the
    /// router's.
    pub ack: bool,

    /// Sender-assigned sequence number.
    pub sequence: u64,

    /// Microseconds since the Unix epoch.
    pub timestamp: u64,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(
        to: impl Into<RouteKey>,
        from: impl Into<AgentId>,
        sequence: u64,
        timestamp: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            ack: false,
            sequence,
            timestamp,
            payload,
        }
    }
}
