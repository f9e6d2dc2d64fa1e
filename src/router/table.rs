//! Route table - the mutable mapping that drives dispatch
//!
//! A route binds a logical key to a destination socket. Outgoing routes
//! match envelopes by their `to` field; incoming (feed) routes forward
//! everything arriving on their source unconditionally. For any
//! (direction, key) pair at most one entry is active, and lookups go
//! through a hash index.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::RouteKey;
use crate::transport::{MessageSocket, SocketRef};

/// Which way a route moves traffic relative to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDirection {
    /// Dispatch rule: envelopes addressed `to` this key leave through the
    /// configured destination.
    Outgoing,

    /// Feed rule: everything arriving `from` this named input is forwarded
    /// unconditionally (scheduler and ack feedback channels).
    Incoming,
}

impl fmt::Display for RouteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDirection::Outgoing => write!(f, "to"),
            RouteDirection::Incoming => write!(f, "from"),
        }
    }
}

/// Stable identifier of a route table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RouteId(pub u64);

/// Request to create a route.
#[derive(Clone)]
pub struct RouteSpec {
    pub to: Option<RouteKey>,
    pub from: Option<RouteKey>,
    pub src: SocketRef,
    pub dest: SocketRef,
    pub static_route: bool,
}

impl RouteSpec {
    /// Dispatch rule: envelopes arriving on `src` addressed to `key` go to
    /// `dest`.
    pub fn to(key: impl Into<RouteKey>, src: SocketRef, dest: SocketRef) -> Self {
        Self {
            to: Some(key.into()),
            from: None,
            src,
            dest,
            static_route: false,
        }
    }

    /// Feed rule: everything arriving on `src` goes to `dest`.
    pub fn from(key: impl Into<RouteKey>, src: SocketRef, dest: SocketRef) -> Self {
        Self {
            to: None,
            from: Some(key.into()),
            src,
            dest,
            static_route: false,
        }
    }

    /// Mark the route static: created at startup, never removable.
    pub fn pinned(mut self) -> Self {
        self.static_route = true;
        self
    }
}

impl fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSpec")
            .field("to", &self.to)
            .field("from", &self.from)
            .field("src", &self.src.name())
            .field("dest", &self.dest.name())
            .field("static_route", &self.static_route)
            .finish()
    }
}

/// An active route.
#[derive(Clone)]
pub struct RouteEntry {
    pub id: RouteId,
    pub key: RouteKey,
    pub direction: RouteDirection,
    pub src: SocketRef,
    pub dest: SocketRef,
    pub static_route: bool,
}

impl RouteEntry {
    pub fn descriptor(&self) -> RouteDescriptor {
        RouteDescriptor {
            id: self.id,
            key: self.key.clone(),
            direction: self.direction,
            src: self.src.name().to_string(),
            dest: self.dest.name().to_string(),
            static_route: self.static_route,
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("direction", &self.direction)
            .field("src", &self.src.name())
            .field("dest", &self.dest.name())
            .field("static_route", &self.static_route)
            .finish()
    }
}

/// Serializable snapshot of a route, as reported by `route_dump`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDescriptor {
    pub id: RouteId,
    pub key: RouteKey,
    pub direction: RouteDirection,
    pub src: String,
    pub dest: String,
    #[serde(rename = "static")]
    pub static_route: bool,
}

/// Errors raised while administering or consulting the route table
#[derive(Debug)]
pub enum RouterError {
    /// An entry already exists for this (direction, key)
    DuplicateRoute {
        direction: RouteDirection,
        key: RouteKey,
    },

    /// The route spec is structurally invalid
    InvalidSpec(String),

    /// A control request referenced a socket name that was never registered
    UnknownSocket(String),

    /// Static routes cannot be removed
    StaticRoute { key: RouteKey },

    /// No entry exists for this (direction, key)
    RouteNotFound {
        direction: RouteDirection,
        key: RouteKey,
    },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::DuplicateRoute { direction, key } => {
                write!(f, "route already exists for {direction}={key}")
            }
            RouterError::InvalidSpec(msg) => write!(f, "invalid route spec: {msg}"),
            RouterError::UnknownSocket(name) => write!(f, "unknown socket: {name}"),
            RouterError::StaticRoute { key } => {
                write!(f, "route {key} is static and cannot be removed")
            }
            RouterError::RouteNotFound { direction, key } => {
                write!(f, "no route for {direction}={key}")
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// The (direction, key)-indexed collection of active routes.
#[derive(Default)]
pub struct RouteTable {
    entries: HashMap<(RouteDirection, RouteKey), RouteEntry>,
    order: Vec<(RouteDirection, RouteKey)>,
    next_id: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a spec and insert the resulting entry.
    ///
    /// Fails with [`RouterError::DuplicateRoute`] when an entry is already
    /// active for the same (direction, key); the existing entry is left
    /// untouched.
    pub fn insert(&mut self, spec: RouteSpec) -> Result<RouteEntry, RouterError> {
        let (direction, key) = match (&spec.to, &spec.from) {
            (Some(key), None) => (RouteDirection::Outgoing, key.clone()),
            (None, Some(key)) => (RouteDirection::Incoming, key.clone()),
            (Some(_), Some(_)) => {
                return Err(RouterError::InvalidSpec(
                    "route spec must not give both `to` and `from`".to_string(),
                ));
            }
            (None, None) => {
                return Err(RouterError::InvalidSpec(
                    "route spec must give one of `to` or `from`".to_string(),
                ));
            }
        };

        if self.entries.contains_key(&(direction, key.clone())) {
            return Err(RouterError::DuplicateRoute { direction, key });
        }

        let entry = RouteEntry {
            id: RouteId(self.next_id),
            key: key.clone(),
            direction,
            src: spec.src,
            dest: spec.dest,
            static_route: spec.static_route,
        };
        self.next_id += 1;

        self.entries.insert((direction, key.clone()), entry.clone());
        self.order.push((direction, key));

        Ok(entry)
    }

    /// O(1) lookup of the active entry for (direction, key).
    pub fn lookup(&self, direction: RouteDirection, key: &RouteKey) -> Option<&RouteEntry> {
        self.entries.get(&(direction, key.clone()))
    }

    /// Remove a dynamic route.
    ///
    /// Static routes refuse removal; unknown keys report
    /// [`RouterError::RouteNotFound`].
    pub fn remove(
        &mut self,
        direction: RouteDirection,
        key: &RouteKey,
    ) -> Result<RouteEntry, RouterError> {
        let slot = (direction, key.clone());

        let entry = self
            .entries
            .get(&slot)
            .ok_or_else(|| RouterError::RouteNotFound {
                direction,
                key: key.clone(),
            })?;

        if entry.static_route {
            return Err(RouterError::StaticRoute { key: key.clone() });
        }

        let entry = self.entries.remove(&slot).expect("entry checked above");
        self.order.retain(|o| *o != slot);

        Ok(entry)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.order
            .iter()
            .filter_map(|slot| self.entries.get(slot))
    }

    /// Snapshot for `route_dump`.
    pub fn descriptors(&self) -> Vec<RouteDescriptor> {
        self.iter().map(RouteEntry::descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any remaining route still reads from the given source.
    pub fn references_source(&self, src: &SocketRef) -> bool {
        self.entries
            .values()
            .any(|entry| std::sync::Arc::ptr_eq(&entry.src, src))
    }
}
