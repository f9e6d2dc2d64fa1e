//! Transport seam between the bus core and whatever carries its messages
//!
//! The router and scheduler never talk to a concrete socket type. They are
//! handed already-wired [`MessageSocket`] trait objects and consume exactly
//! two primitives: "receive one envelope from socket S" and "send envelope M
//! to socket D". A bounded in-process channel implementation lives in
//! [`channel`]; broker-backed transports plug in behind the same traits.
//!
//! ## Backpressure
//!
//! Every socket carries a high-water-mark: a bound on queued-but-unsent
//! envelopes. Non-blocking sends fail with [`TransportError::Saturated`]
//! once the mark is reached. The router treats saturation as transient
//! (count and continue); retry is a sender concern.

pub mod channel;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Envelope;

/// Shared reference to a message socket.
///
/// Socket identity (for poller deduplication) is the identity of the
/// allocation: two refs name the same socket iff `Arc::ptr_eq` holds.
pub type SocketRef = Arc<dyn MessageSocket>;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur at the socket layer
#[derive(Debug)]
pub enum TransportError {
    /// The socket's high-water-mark is reached; the send was not queued
    Saturated { socket: String },

    /// The socket (or its peer) is closed
    Closed { socket: String },

    /// A bounded send did not complete within its deadline
    Timeout { socket: String },
}

impl TransportError {
    /// Name of the socket the error occurred on.
    pub fn socket(&self) -> &str {
        match self {
            TransportError::Saturated { socket }
            | TransportError::Closed { socket }
            | TransportError::Timeout { socket } => socket,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Saturated { socket } => {
                write!(f, "socket {socket} saturated (high-water-mark reached)")
            }
            TransportError::Closed { socket } => write!(f, "socket {socket} is closed"),
            TransportError::Timeout { socket } => {
                write!(f, "send on socket {socket} timed out")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// One end of a message-carrying socket.
///
/// The router's poll loop relies on the non-blocking pair
/// (`try_recv`/`try_send`) so a single task can sweep many sockets without
/// ever parking on one of them. The async `send` exists for callers outside
/// that loop (feeders, tests) that prefer to wait out backpressure.
#[async_trait]
pub trait MessageSocket: Send + Sync + fmt::Debug {
    /// Diagnostic name, used in logs and route dumps.
    fn name(&self) -> &str;

    /// Receive one envelope if one is ready. Never blocks.
    fn try_recv(&self) -> TransportResult<Option<Envelope>>;

    /// Queue one envelope if the high-water-mark permits. Never blocks.
    fn try_send(&self, envelope: Envelope) -> TransportResult<()>;

    /// Queue one envelope, waiting for capacity if necessary.
    async fn send(&self, envelope: Envelope) -> TransportResult<()>;

    /// Mark the socket closed. Idempotent; later operations fail with
    /// [`TransportError::Closed`].
    fn close(&self);

    /// Whether [`MessageSocket::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// Server end of a request/reply control channel.
///
/// Strictly alternating: each received request is answered by exactly one
/// reply (or deliberately none, for unparsable requests).
#[async_trait]
pub trait ControlSocket: Send + Sync + fmt::Debug {
    /// Receive one pending request body if one is ready. Never blocks.
    fn try_recv(&self) -> TransportResult<Option<String>>;

    /// Send a reply to the most recently received request.
    async fn send(&self, reply: String) -> TransportResult<()>;
}
